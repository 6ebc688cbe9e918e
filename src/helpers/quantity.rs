use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_PODS: &str = "pods";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QuantityError {
    #[error("invalid quantity for {0}: {1}")]
    InvalidQuantity(String, String),
}

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 9] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parses a kubernetes quantity ("500m", "1.5", "200Mi", "1e3", ...) into its
/// plain numeric value.
pub fn parse_quantity(resource: &str, q: &Quantity) -> Result<f64, QuantityError> {
    let raw = q.0.trim();
    let invalid = || QuantityError::InvalidQuantity(resource.to_string(), q.0.clone());

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    if suffix.is_empty() {
        return Ok(number);
    }

    if let Some((_, factor)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok(number * factor);
    }

    // "1e3" is an exponent, a bare "E" is exa
    if let Some(exp) = suffix.strip_prefix(&['e', 'E'][..]) {
        if !exp.is_empty() {
            let exp: i32 = exp.parse().map_err(|_| invalid())?;
            return Ok(number * 10f64.powi(exp));
        }
    }

    if let Some((_, factor)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok(number * factor);
    }

    Err(invalid())
}

/// Returns the integer value used for accounting: millicores for cpu, the
/// value rounded up for every other resource.
pub fn resource_value(resource: &str, q: &Quantity) -> Result<i64, QuantityError> {
    let value = parse_quantity(resource, q)?;
    if resource == RESOURCE_CPU {
        Ok((value * 1000.0).round() as i64)
    } else {
        Ok(value.ceil() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn should_parse_cpu_quantity() -> Result<(), QuantityError> {
        assert_eq!(resource_value(RESOURCE_CPU, &q("200m"))?, 200);
        assert_eq!(resource_value(RESOURCE_CPU, &q("1"))?, 1000);
        assert_eq!(resource_value(RESOURCE_CPU, &q("0.1"))?, 100);
        assert_eq!(resource_value(RESOURCE_CPU, &q("2"))?, 2000);
        assert_eq!(resource_value(RESOURCE_CPU, &q("1.5"))?, 1500);

        let result = resource_value(RESOURCE_CPU, &q("invalid"));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn should_parse_memory_quantity() -> Result<(), QuantityError> {
        assert_eq!(
            resource_value(RESOURCE_MEMORY, &q("200Mi"))?,
            200 * 1024 * 1024
        );
        assert_eq!(
            resource_value(RESOURCE_MEMORY, &q("1Gi"))?,
            1024 * 1024 * 1024
        );
        assert_eq!(resource_value(RESOURCE_MEMORY, &q("500Ki"))?, 500 * 1024);
        assert_eq!(resource_value(RESOURCE_MEMORY, &q("200M"))?, 200_000_000);
        assert_eq!(resource_value(RESOURCE_MEMORY, &q("500k"))?, 500_000);
        assert_eq!(resource_value(RESOURCE_MEMORY, &q("1e3"))?, 1000);
        assert_eq!(resource_value(RESOURCE_MEMORY, &q("1024"))?, 1024);

        assert!(resource_value(RESOURCE_MEMORY, &q("12Qi")).is_err());
        Ok(())
    }

    #[test]
    fn should_parse_counts() -> Result<(), QuantityError> {
        assert_eq!(resource_value(RESOURCE_PODS, &q("110"))?, 110);
        assert_eq!(resource_value("nvidia.com/gpu", &q("2"))?, 2);
        Ok(())
    }
}
