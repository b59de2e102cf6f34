// Jackson Coxson

use crate::LockdownError;

/// Encodes a plist value as the XML document lockdownd expects
pub fn plist_to_xml_bytes(p: &plist::Value) -> Result<Vec<u8>, LockdownError> {
    let mut buf = Vec::new();
    p.to_writer_xml(&mut buf)?;
    Ok(buf)
}

/// Renders a plist for logs. Data blobs are shown by size only, since pair records
/// carry private keys.
pub fn pretty_print_plist(p: &plist::Value) -> String {
    print_plist(p, 0)
}

pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    print_dictionary(dict, 0)
}

fn print_dictionary(dict: &plist::Dictionary, indent: usize) -> String {
    let pad = "  ".repeat(indent + 1);
    let entries = dict
        .iter()
        .map(|(k, v)| format!("{pad}{k}: {}", print_plist(v, indent + 1)))
        .collect::<Vec<String>>();
    if entries.is_empty() {
        return "{}".to_string();
    }
    format!("{{\n{}\n{}}}", entries.join(",\n"), "  ".repeat(indent))
}

fn print_plist(p: &plist::Value, indent: usize) -> String {
    match p {
        plist::Value::Dictionary(d) => print_dictionary(d, indent),
        plist::Value::Array(a) => {
            let items = a
                .iter()
                .map(|v| print_plist(v, indent + 1))
                .collect::<Vec<String>>();
            format!("[{}]", items.join(", "))
        }
        plist::Value::String(s) => format!("\"{s}\""),
        plist::Value::Boolean(b) => b.to_string(),
        plist::Value::Integer(i) => match i.as_signed() {
            Some(v) => v.to_string(),
            None => i.as_unsigned().unwrap_or_default().to_string(),
        },
        plist::Value::Real(r) => r.to_string(),
        plist::Value::Data(d) => format!("<{} bytes>", d.len()),
        plist::Value::Date(d) => d.to_xml_format(),
        plist::Value::Uid(u) => format!("uid({})", u.get()),
        _ => "<unknown>".to_string(),
    }
}
