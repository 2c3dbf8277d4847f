use getrandom::getrandom;

const HEX_ALPHABET: &[u8; 16] = b"0123456789abcdef";

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect()
}

fn random_hex(len: usize) -> Result<String, String> {
    let mut bytes = vec![0_u8; len.div_ceil(2)];
    getrandom(&mut bytes).map_err(|err| format!("failed to generate id randomness: {err}"))?;
    let mut out = String::with_capacity(len);
    for byte in bytes {
        out.push(HEX_ALPHABET[(byte >> 4) as usize] as char);
        out.push(HEX_ALPHABET[(byte & 0x0f) as usize] as char);
    }
    out.truncate(len);
    Ok(out)
}

/// Pipeline execution ids use the fixed `pe-<12hex>` format.
pub fn generate_execution_id() -> Result<String, String> {
    Ok(format!("pe-{}", random_hex(12)?))
}

/// Approval tokens are wider than execution ids; they gate a state
/// transition and must be infeasible to guess.
pub fn generate_approval_token() -> Result<String, String> {
    Ok(format!("apv-{}", random_hex(32)?))
}

pub fn generate_run_id(prefix: &str, now: i64) -> Result<String, String> {
    Ok(format!("{prefix}-{}-{}", now.max(0), random_hex(8)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_ids_use_fixed_format() {
        let id = generate_execution_id().expect("id");
        assert_eq!(id.len(), "pe-".len() + 12);
        assert!(id.starts_with("pe-"));
        assert!(id[3..].chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn approval_tokens_are_unique_enough() {
        let first = generate_approval_token().expect("token");
        let second = generate_approval_token().expect("token");
        assert_ne!(first, second);
    }

    #[test]
    fn identifier_validation_rejects_bad_chars() {
        assert!(validate_identifier_value("job id", "job-1_a").is_ok());
        assert!(validate_identifier_value("job id", "").is_err());
        assert!(validate_identifier_value("job id", "a b").is_err());
    }
}
