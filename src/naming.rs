//! Deterministic names derived from function and tool identifiers.
//!
//! Every name the rest of the crate stores or references is derived here from
//! a snake_case identifier alone: state names, result containers, and the
//! storage keys holding registered function ids and their checksums.

/// UpperCamelCase state name for a snake_case identifier (`hello_world` -> `HelloWorld`).
pub fn state_name(identifier: &str) -> String {
    identifier
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Result container of a state (`$.<StateName>`).
pub fn result_path(state: &str) -> String {
    format!("$.{state}")
}

/// Where a compute state's task results live once the state has run.
pub fn results_reference(state: &str) -> String {
    format!("$.{state}.details.results")
}

/// Storage key of a function's registered id.
pub fn function_id_key(identifier: &str) -> String {
    format!("{identifier}_function_id")
}

/// Storage key of the checksum recorded when the function was registered.
pub fn function_checksum_key(identifier: &str) -> String {
    format!("{identifier}_function_id_checksum")
}

/// snake_case form of a CamelCase or mixed identifier (`MyClient` -> `my_client`).
///
/// An acronym run ends before its last capital when a lowercase letter
/// follows (`HTTPServer` -> `http_server`).
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (index, &ch) in chars.iter().enumerate() {
        if matches!(ch, '-' | ' ' | '_') {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if !ch.is_uppercase() {
            out.push(ch);
            continue;
        }

        let prev = index.checked_sub(1).map(|i| chars[i]);
        let next = chars.get(index + 1).copied();
        let boundary = match prev {
            Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
            Some(p) if p.is_uppercase() => next.is_some_and(char::is_lowercase),
            _ => false,
        };
        if boundary && !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
        out.extend(ch.to_lowercase());
    }
    out.trim_end_matches('_').to_string()
}

/// Prefix given to input variables of an aliased tool (`First` -> `first_`).
pub fn alias_prefix(alias: &str) -> String {
    format!("{}_", snake_case(alias))
}

/// Whether `name` is a valid snake_case identifier (lowercase, digits, underscores).
pub fn is_snake_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
