//! Strict numeric coercion for node configs.
//!
//! Documents come through JSON or YAML, so integers may arrive as floats.
//! A float is accepted for an integer field only when it has no fractional
//! part; non-finite values are always rejected.

use serde_json::Value;

/// Read a float field.
pub fn to_f64(value: &Value, field: &str) -> Result<f64, String> {
    let n = value
        .as_f64()
        .ok_or_else(|| format!("{} must be a number, got {}", field, value))?;
    if !n.is_finite() {
        return Err(format!("{} must be finite, got {}", field, n));
    }
    Ok(n)
}

/// Read an integer field.
pub fn to_i64(value: &Value, field: &str) -> Result<i64, String> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    if value.as_u64().is_some() {
        return Err(format!("{} is out of range, got {}", field, value));
    }
    let n = to_f64(value, field)?;
    if n.fract() != 0.0 {
        return Err(format!("{} must be an integer, got {}", field, n));
    }
    // 2^63 is exact in f64; `i64::MAX as f64` rounds up to it
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if !(-LIMIT..LIMIT).contains(&n) {
        return Err(format!("{} is out of range, got {}", field, n));
    }
    Ok(n as i64)
}

/// Read a strictly positive integer field.
pub fn to_positive_i64(value: &Value, field: &str) -> Result<i64, String> {
    let n = to_i64(value, field)?;
    if n <= 0 {
        return Err(format!("{} must be positive", field));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn integral_floats_are_integers() {
        assert_eq!(to_i64(&json!(512), "max_tokens"), Ok(512));
        assert_eq!(to_i64(&json!(512.0), "max_tokens"), Ok(512));
    }

    #[test]
    fn fractions_are_rejected_with_the_field_name() {
        assert_eq!(
            to_i64(&json!(1.5), "max_tokens"),
            Err("max_tokens must be an integer, got 1.5".to_string())
        );
    }

    #[test]
    fn non_numbers_are_rejected() {
        assert!(to_f64(&json!("hot"), "temperature").unwrap_err().contains("temperature must be a number"));
        assert!(to_i64(&Value::Null, "thinking_tokens").is_err());
        assert!(to_i64(&json!(u64::MAX), "max_tokens").unwrap_err().contains("out of range"));
    }

    #[test]
    fn float_range_ends_below_two_to_the_63() {
        assert!(to_i64(&json!(9_223_372_036_854_775_808.0_f64), "max_tokens").unwrap_err().contains("out of range"));
        assert!(to_i64(&json!(9.3e18), "max_tokens").is_err());
        assert_eq!(to_i64(&json!(-9_223_372_036_854_775_808.0_f64), "max_tokens"), Ok(i64::MIN));
        assert_eq!(to_i64(&json!(4_611_686_018_427_387_904.0_f64), "max_tokens"), Ok(1 << 62));
    }

    #[test]
    fn positive_guard() {
        assert_eq!(to_positive_i64(&json!(0), "max_tokens"), Err("max_tokens must be positive".to_string()));
        assert_eq!(to_positive_i64(&json!(-3), "thinking_tokens"), Err("thinking_tokens must be positive".to_string()));
        assert_eq!(to_positive_i64(&json!(8), "max_tokens"), Ok(8));
    }
}
