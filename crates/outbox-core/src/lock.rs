//! Advisory-lock identifier derivation.
//!
//! Concurrent bootstraps against the same table serialize on a lock whose
//! id is derived deterministically from the store's naming parts, so every
//! process arrives at the same number without coordination.

const ADVISORY_LOCK_ID_SALT: u32 = 1486364155;

/// Derive the advisory-lock id for the given naming parts.
///
/// Additional names are joined ahead of the primary name with a NUL
/// separator, checksummed with CRC-32 (IEEE), and salted. Identical inputs
/// produce identical output on every host.
pub fn generate_id(database_name: &str, additional_names: &[&str]) -> u32 {
    let joined;
    let input = if additional_names.is_empty() {
        database_name
    } else {
        let mut parts = additional_names.to_vec();
        parts.push(database_name);
        joined = parts.join("\u{0}");
        &joined
    };

    crc32fast::hash(input.as_bytes()).wrapping_mul(ADVISORY_LOCK_ID_SALT)
}

/// [`generate_id`] formatted as a decimal string, for backends that take
/// the lock name as text.
pub fn generate(database_name: &str, additional_names: &[&str]) -> String {
    generate_id(database_name, additional_names).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_the_expected_id() {
        let aid = generate("test", &["extraKey"]);
        assert_eq!(aid, "233322130");
    }

    #[test]
    fn is_deterministic() {
        assert_eq!(
            generate("events", &["public"]),
            generate("events", &["public"])
        );
    }

    #[test]
    fn additional_names_change_the_id() {
        assert_ne!(generate("test", &[]), generate("test", &["extraKey"]));
    }

    #[test]
    fn string_form_matches_the_raw_id() {
        assert_eq!(
            generate("db", &["schema"]),
            generate_id("db", &["schema"]).to_string()
        );
    }
}
