// Bridge framework (spec §4.9): O2 message delivery to endpoints that
// aren't full O2 processes over IP — a same-host process sharing memory
// instead of sockets, a resource-constrained embedded client speaking a
// reduced "o2lite" protocol, or a browser speaking WebSocket. Every bridge
// exposes the same `ServiceProxy` seam as a `RemoteProcessProxy`, so the
// router never needs to know which kind of bridge it's talking to.

pub mod o2lite;
pub mod shmem;
pub mod ws;
