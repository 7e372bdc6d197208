use serde::{Deserialize, Serialize};

/// How host member names become column names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConvention {
    /// Lowercase the first character only: `UserId` -> `userId`.
    CamelCase,
    /// `_` before every internal uppercase letter, then lowercase: `UserId` -> `user_id`.
    #[default]
    SnakeCase,
}

impl NamingConvention {
    pub fn translate(self, name: &str) -> String {
        match self {
            NamingConvention::CamelCase => camel_case(name),
            NamingConvention::SnakeCase => snake_case(name),
        }
    }
}

fn camel_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Last path segment of a Rust type name, generics stripped.
pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_only_touches_first_char() {
        let c = NamingConvention::CamelCase;
        assert_eq!(c.translate("UserId"), "userId");
        assert_eq!(c.translate("userId"), "userId");
        assert_eq!(c.translate("user_id"), "user_id");
        assert_eq!(c.translate(""), "");
    }

    #[test]
    fn snake_case_splits_on_uppercase() {
        let s = NamingConvention::SnakeCase;
        assert_eq!(s.translate("ScheduledPost"), "scheduled_post");
        assert_eq!(s.translate("userId"), "user_id");
        assert_eq!(s.translate("user_id"), "user_id");
        assert_eq!(s.translate("HTTPServer"), "h_t_t_p_server");
    }

    #[test]
    fn type_names_lose_their_path() {
        assert_eq!(short_type_name("relmap::model::PostTarget"), "PostTarget");
        assert_eq!(short_type_name("a::Wrapper<b::Inner>"), "Wrapper");
        assert_eq!(short_type_name("Plain"), "Plain");
    }
}
