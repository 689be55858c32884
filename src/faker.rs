//! Faker generation: `category.method(args?)` dispatch.
//!
//! Backs `#faker.` expressions and the faker interpolation strategy.
//! Arguments, when present, are a comma-separated list of JSON values:
//! `#faker.internet.password(8, 16)`, `#faker.number.int(1, 100)`.

use chrono::{Duration, Utc};
use fake::faker::address::en::{CityName, CountryName, StreetName, ZipCode};
use fake::faker::boolean::en::Boolean;
use fake::faker::company::en::{Buzzword, CompanyName, Industry};
use fake::faker::internet::en::{IPv4, IPv6, Password, SafeEmail, UserAgent, Username};
use fake::faker::lorem::en::{Paragraph, Sentence, Word, Words};
use fake::faker::name::en::{FirstName, LastName, Name};
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use serde_json::{json, Value};

use crate::{Error, Result};

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a value for a faker expression payload
/// (the part after `#faker.`).
///
/// # Errors
///
/// Returns a faker error for unknown categories/methods or malformed
/// argument lists.
pub fn generate(spec: &str) -> Result<Value> {
    let (category, method, args) = parse_spec(spec)?;
    dispatch(&category, &method, &args)
        .ok_or_else(|| Error::Faker(format!("Unknown faker expression: {category}.{method}")))
}

/// Split `category.method(args?)` into its parts.
fn parse_spec(spec: &str) -> Result<(String, String, Vec<Value>)> {
    let spec = spec.trim();
    let (name, args) = match spec.split_once('(') {
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix(')')
                .ok_or_else(|| Error::Faker(format!("Unclosed argument list: {spec}")))?;
            (name.trim(), parse_args(inner)?)
        }
        None => (spec, Vec::new()),
    };

    let (category, method) = name
        .split_once('.')
        .ok_or_else(|| Error::Faker(format!("Expected category.method, got: {name}")))?;
    Ok((
        category.trim().to_ascii_lowercase(),
        normalize(method),
        args,
    ))
}

fn parse_args(inner: &str) -> Result<Vec<Value>> {
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&format!("[{inner}]"))
        .map_err(|e| Error::Faker(format!("Invalid faker arguments '{inner}': {e}")))
}

/// Methods arrive in the original camelCase surface (`firstName`);
/// normalize to lowercase-without-separators for matching.
fn normalize(method: &str) -> String {
    method
        .trim()
        .chars()
        .filter(|c| *c != '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn dispatch(category: &str, method: &str, args: &[Value]) -> Option<Value> {
    let value = match (category, method) {
        ("name", "firstname") => json!(FirstName().fake::<String>()),
        ("name", "lastname") => json!(LastName().fake::<String>()),
        ("name", "fullname" | "name") => json!(Name().fake::<String>()),

        ("internet", "email") => json!(SafeEmail().fake::<String>()),
        ("internet", "username" | "user") => json!(Username().fake::<String>()),
        ("internet", "password") => {
            let (min, max) = range_args(args, 12, 16);
            json!(Password(min..max.max(min + 1)).fake::<String>())
        }
        ("internet", "ipv4" | "ip") => json!(IPv4().fake::<String>()),
        ("internet", "ipv6") => json!(IPv6().fake::<String>()),
        ("internet", "useragent") => json!(UserAgent().fake::<String>()),
        ("internet", "url") => {
            json!(format!("https://{}.example.com", Word().fake::<String>()))
        }

        ("lorem", "word") => json!(Word().fake::<String>()),
        ("lorem", "words") => {
            let count = int_arg(args, 0).unwrap_or(3).max(1) as usize;
            json!(Words(count..count + 1).fake::<Vec<String>>().join(" "))
        }
        ("lorem", "sentence") => json!(Sentence(4..10).fake::<String>()),
        ("lorem", "paragraph") => json!(Paragraph(2..5).fake::<String>()),

        ("number", "int" | "integer") => {
            let min = int_arg(args, 0).unwrap_or(0);
            let max = int_arg(args, 1).unwrap_or(min + 1000);
            json!((min..max.max(min + 1)).fake::<i64>())
        }
        ("number", "float") => {
            let min = float_arg(args, 0).unwrap_or(0.0);
            let max = float_arg(args, 1).unwrap_or(min + 1.0);
            json!((min..if max > min { max } else { min + 1.0 }).fake::<f64>())
        }

        ("uuid", "uuid4" | "v4" | "uuid") => json!(uuid::Uuid::new_v4().to_string()),

        ("date", "iso" | "now") => json!(Utc::now().to_rfc3339()),
        ("date", "timestamp") => json!(Utc::now().timestamp_millis()),
        ("date", "past") => {
            let seconds = (3600..86_400 * 365).fake::<i64>();
            json!((Utc::now() - Duration::seconds(seconds)).to_rfc3339())
        }
        ("date", "recent") => {
            let seconds = (60..86_400).fake::<i64>();
            json!((Utc::now() - Duration::seconds(seconds)).to_rfc3339())
        }
        ("date", "future") => {
            let seconds = (3600..86_400 * 365).fake::<i64>();
            json!((Utc::now() + Duration::seconds(seconds)).to_rfc3339())
        }

        ("address", "city") => json!(CityName().fake::<String>()),
        ("address", "street" | "streetname") => json!(StreetName().fake::<String>()),
        ("address", "zipcode" | "zip") => json!(ZipCode().fake::<String>()),
        ("address", "country") => json!(CountryName().fake::<String>()),

        ("company", "name") => json!(CompanyName().fake::<String>()),
        ("company", "buzzword") => json!(Buzzword().fake::<String>()),
        ("company", "industry") => json!(Industry().fake::<String>()),

        ("phone", "number" | "phonenumber") => json!(PhoneNumber().fake::<String>()),

        ("boolean", "boolean" | "bool") => {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let ratio = int_arg(args, 0).unwrap_or(50).clamp(0, 100) as u8;
            json!(Boolean(ratio).fake::<bool>())
        }

        ("string", "alphanumeric") => {
            let len = int_arg(args, 0).unwrap_or(10).max(1) as usize;
            let s: String = (0..len)
                .map(|_| {
                    let idx = (0..ALPHANUMERIC.len()).fake::<usize>();
                    ALPHANUMERIC[idx] as char
                })
                .collect();
            json!(s)
        }

        _ => return None,
    };
    Some(value)
}

fn int_arg(args: &[Value], index: usize) -> Option<i64> {
    args.get(index).and_then(Value::as_i64)
}

fn float_arg(args: &[Value], index: usize) -> Option<f64> {
    args.get(index).and_then(Value::as_f64)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn range_args(args: &[Value], default_min: i64, default_max: i64) -> (usize, usize) {
    let min = int_arg(args, 0).unwrap_or(default_min).max(1);
    let max = int_arg(args, 1).unwrap_or_else(|| min.max(default_max));
    (min as usize, max.max(min) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_first_names() {
        let value = generate("name.firstName").unwrap();
        assert!(value.as_str().is_some_and(|s| !s.is_empty()));
    }

    #[test]
    fn email_contains_an_at_sign() {
        let value = generate("internet.email").unwrap();
        assert!(value.as_str().unwrap().contains('@'));
    }

    #[test]
    fn int_respects_bounds() {
        for _ in 0..50 {
            let value = generate("number.int(5, 10)").unwrap();
            let n = value.as_i64().unwrap();
            assert!((5..10).contains(&n), "{n} out of range");
        }
    }

    #[test]
    fn password_length_honors_args() {
        let value = generate("internet.password(8, 9)").unwrap();
        assert!(value.as_str().unwrap().len() >= 8);
    }

    #[test]
    fn uuid_is_well_formed() {
        let value = generate("uuid.uuid4").unwrap();
        assert!(uuid::Uuid::parse_str(value.as_str().unwrap()).is_ok());
    }

    #[test]
    fn alphanumeric_has_requested_length() {
        let value = generate("string.alphanumeric(24)").unwrap();
        let s = value.as_str().unwrap();
        assert_eq!(s.len(), 24);
        assert!(s.chars().all(char::is_alphanumeric));
    }

    #[test]
    fn snake_case_methods_are_accepted() {
        assert!(generate("name.first_name").is_ok());
        assert!(generate("address.zip_code").is_ok());
    }

    #[test]
    fn unknown_method_is_an_error() {
        assert!(matches!(generate("name.nonexistent"), Err(Error::Faker(_))));
    }

    #[test]
    fn malformed_args_are_an_error() {
        assert!(matches!(
            generate("number.int(1,"),
            Err(Error::Faker(_))
        ));
    }
}
