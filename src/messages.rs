//! Messages shown to refused registrants.
//!
//! Templates accept `@email`, `@username` and `@ip` (HTML-escaped value) and
//! `%email`, `%username` and `%ip` (escaped value wrapped in a placeholder `<em>`).

use crate::identity::{Field, IdentityTriple};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedMessages {
    email: String,
    username: String,
    ip: String,
}

impl BlockedMessages {
    pub fn new(email: &str, username: &str, ip: &str) -> Self {
        Self {
            email: email.to_string(),
            username: username.to_string(),
            ip: ip.to_string(),
        }
    }

    pub fn template(&self, field: Field) -> &str {
        match field {
            Field::Email => &self.email,
            Field::Username => &self.username,
            Field::Ip => &self.ip,
        }
    }

    /// Message for a refusal triggered by `field`
    pub fn render(&self, field: Field, identity: &IdentityTriple) -> String {
        substitute(self.template(field), identity)
    }
}

fn substitute(template: &str, identity: &IdentityTriple) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    'scan: while let Some(pos) = rest.find(['@', '%']) {
        out.push_str(&rest[..pos]);
        let (sigil, tail) = rest[pos..].split_at(1);

        for field in Field::ALL {
            let name = field.as_str();
            if tail.starts_with(name) && !continues_word(&tail[name.len()..]) {
                let value = escape_html(identity.get(field).unwrap_or_default());
                if sigil == "%" {
                    out.push_str("<em class=\"placeholder\">");
                    out.push_str(&value);
                    out.push_str("</em>");
                } else {
                    out.push_str(&value);
                }
                rest = &tail[name.len()..];
                continue 'scan;
            }
        }

        out.push_str(sigil);
        rest = tail;
    }

    out.push_str(rest);
    out
}

// "@emails" is not the @email token
fn continues_word(rest: &str) -> bool {
    rest.chars()
        .next()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
