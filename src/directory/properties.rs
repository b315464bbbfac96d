// Service property strings (spec §4.3 "Property strings"): a flat list of
// `attr:value` pairs delimited by leading/trailing semicolons, e.g.
// `;width:800;height:600;`. Grounded on `properties.h`'s two entry points —
// `o2_service_provider_set_property` (set one attribute) and
// `o2_set_service_properties` (replace the whole string) — reduced here to
// plain functions over an owned `String` since this crate has no
// process-wide service table to mutate in place.

/// Looks up `attr` in the `;attr:value;` grammar, returning its value if
/// present.
pub fn get(properties: &str, attr: &str) -> Option<String> {
    let needle = format!(";{}:", attr);
    let start = properties.find(&needle)? + needle.len();
    let end = properties[start..].find(';').map(|i| start + i)?;
    Some(properties[start..end].to_string())
}

/// Returns `properties` with `attr` set to `value`, replacing any existing
/// entry for the same attribute. The result always begins and ends with
/// `;`, even if `properties` was empty.
pub fn set(properties: &str, attr: &str, value: &str) -> String {
    let mut without = remove(properties, attr);
    if without.is_empty() {
        without.push(';');
    }
    without.push_str(&format!("{}:{};", attr, value));
    without
}

/// Returns `properties` with `attr` removed, if present.
pub fn remove(properties: &str, attr: &str) -> String {
    let needle = format!(";{}:", attr);
    let Some(start) = properties.find(&needle) else {
        return properties.to_string();
    };
    let Some(end) = properties[start + 1..].find(';').map(|i| start + 1 + i) else {
        return properties.to_string();
    };
    let mut out = String::with_capacity(properties.len());
    out.push_str(&properties[..start]);
    out.push_str(&properties[end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gets_a_value_out_of_the_semicolon_grammar() {
        assert_eq!(get(";width:800;height:600;", "height"), Some("600".to_string()));
        assert_eq!(get(";width:800;", "missing"), None);
    }

    #[test]
    fn set_adds_a_new_attribute() {
        let props = set("", "width", "800");
        assert_eq!(get(&props, "width"), Some("800".to_string()));
    }

    #[test]
    fn set_replaces_an_existing_attribute_in_place() {
        let props = set(";width:800;height:600;", "width", "1024");
        assert_eq!(get(&props, "width"), Some("1024".to_string()));
        assert_eq!(get(&props, "height"), Some("600".to_string()));
    }

    #[test]
    fn remove_drops_the_attribute_and_nothing_else() {
        let props = remove(";width:800;height:600;", "width");
        assert_eq!(get(&props, "width"), None);
        assert_eq!(get(&props, "height"), Some("600".to_string()));
    }
}
