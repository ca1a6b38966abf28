//! Line protocol encoding for point batches

use super::{FieldValue, Point};
use std::fmt::Write;

/// Encode a batch of points, one line per point
pub fn encode_points(points: &[Point]) -> String {
    let mut out = String::with_capacity(points.len() * 64);
    for point in points {
        if point.fields.is_empty() {
            continue;
        }
        encode_point_into(point, &mut out);
        out.push('\n');
    }
    out
}

/// Encode a single point without the trailing newline
pub fn encode_point(point: &Point) -> String {
    let mut out = String::new();
    encode_point_into(point, &mut out);
    out
}

fn encode_point_into(point: &Point, out: &mut String) {
    escape_into(&point.measurement, &[',', ' '], out);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        out.push(',');
        escape_into(key, &[',', '=', ' '], out);
        out.push('=');
        escape_into(value, &[',', '=', ' '], out);
    }

    out.push(' ');
    let mut first = true;
    for (key, value) in &point.fields {
        if !first {
            out.push(',');
        }
        first = false;
        escape_into(key, &[',', '=', ' '], out);
        out.push('=');
        encode_field(value, out);
    }

    let _ = write!(out, " {}", point.timestamp);
}

fn encode_field(value: &FieldValue, out: &mut String) {
    match value {
        FieldValue::Float(v) => {
            let _ = write!(out, "{}", v);
        }
        FieldValue::Integer(v) => {
            let _ = write!(out, "{}i", v);
        }
        FieldValue::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        FieldValue::String(v) => {
            out.push('"');
            escape_into(v, &['"', '\\'], out);
            out.push('"');
        }
    }
}

fn escape_into(s: &str, special: &[char], out: &mut String) {
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_typed_fields() {
        let point = Point::new("cpu", 1_000)
            .tag("host", "server01")
            .field("a_float", FieldValue::Float(0.64))
            .field("b_int", FieldValue::Integer(42))
            .field("c_bool", FieldValue::Boolean(true))
            .field("d_str", FieldValue::String("ok".to_string()));

        assert_eq!(
            encode_point(&point),
            "cpu,host=server01 a_float=0.64,b_int=42i,c_bool=true,d_str=\"ok\" 1000"
        );
    }

    #[test]
    fn test_encode_escapes() {
        let point = Point::new("disk usage", 7)
            .tag("path", "/var/a b")
            .tag("k=v", "x,y")
            .field("msg", FieldValue::String("say \"hi\"".to_string()));

        assert_eq!(
            encode_point(&point),
            "disk\\ usage,k\\=v=x\\,y,path=/var/a\\ b msg=\"say \\\"hi\\\"\" 7"
        );
    }

    #[test]
    fn test_encode_skips_fieldless_points() {
        let points = vec![
            Point::new("cpu", 1),
            Point::new("cpu", 2).field("v", FieldValue::Integer(1)),
        ];
        assert_eq!(encode_points(&points), "cpu v=1i 2\n");
    }

    #[test]
    fn test_tags_sorted() {
        let point = Point::new("m", 5)
            .tag("zone", "z")
            .tag("app", "a")
            .field("v", FieldValue::Float(1.0));
        assert_eq!(encode_point(&point), "m,app=a,zone=z v=1 5");
    }
}
