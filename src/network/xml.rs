//! GameStream XML response bodies
//!
//! Every endpoint answers with a `<root status_code="…">` document; the
//! protocol predates JSON APIs and clients parse these with fairly rigid
//! expectations, so the shape is kept byte-boring.

use crate::config::App;

pub(crate) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// `<root status_code="…">` with one element per field.
pub(crate) fn root(status_code: u16, fields: &[(&str, String)]) -> String {
    let mut out = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\r\n<root status_code=\"{status_code}\">"
    );
    for (name, value) in fields {
        out.push_str(&format!("<{name}>{}</{name}>", escape(value)));
    }
    out.push_str("</root>");
    out
}

pub(crate) fn root_error(status_code: u16, message: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\r\n<root status_code=\"{status_code}\" status_message=\"{}\"/>",
        escape(message)
    )
}

pub(crate) fn app_list(apps: &[std::sync::Arc<App>]) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\r\n<root status_code=\"200\">",
    );
    for app in apps {
        out.push_str("<App>");
        out.push_str(&format!("<ID>{}</ID>", escape(&app.id)));
        out.push_str(&format!("<AppTitle>{}</AppTitle>", escape(&app.title)));
        out.push_str(&format!(
            "<IsHdrSupported>{}</IsHdrSupported>",
            u8::from(app.support_hdr)
        ));
        out.push_str("</App>");
    }
    out.push_str("</root>");
    out
}
