//! Bus match rules for `AddMatch`/`RemoveMatch`.

use std::fmt;

/// A match rule, rendered as `key='value',…`.
///
/// ```
/// use dbx::MatchRule;
///
/// let rule = MatchRule::signal()
///     .interface("org.freedesktop.DBus.Properties")
///     .member("PropertiesChanged");
/// assert_eq!(
///     rule.to_string(),
///     "type='signal',interface='org.freedesktop.DBus.Properties',member='PropertiesChanged'"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    /// `type`: `signal`, `method_call`, `method_return` or `error`.
    kind: Option<&'static str>,
    /// `sender`
    sender: Option<String>,
    /// `path`
    path: Option<String>,
    /// `interface`
    interface: Option<String>,
    /// `member`
    member: Option<String>,
}

impl MatchRule {
    /// A rule matching every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// A rule matching signals.
    pub fn signal() -> Self {
        Self {
            kind: Some("signal"),
            ..Self::default()
        }
    }

    /// Restricts the sender.
    #[must_use]
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Restricts the object path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Restricts the interface.
    #[must_use]
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Restricts the member.
    #[must_use]
    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }
}

/// Quotes a value; an embedded `'` becomes `'\''`.
fn quote(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    f.write_str("'")?;
    for (i, part) in value.split('\'').enumerate() {
        if i > 0 {
            f.write_str("'\\''")?;
        }
        f.write_str(part)?;
    }
    f.write_str("'")
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = [
            ("type", self.kind),
            ("sender", self.sender.as_deref()),
            ("path", self.path.as_deref()),
            ("interface", self.interface.as_deref()),
            ("member", self.member.as_deref()),
        ];
        let mut first = true;
        for (key, value) in pairs {
            let Some(value) = value else { continue };
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(key)?;
            f.write_str("=")?;
            quote(f, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_in_fixed_order() {
        let rule = MatchRule::signal()
            .member("NameAcquired")
            .path("/org/freedesktop/DBus")
            .sender("org.freedesktop.DBus");
        assert_eq!(
            rule.to_string(),
            "type='signal',sender='org.freedesktop.DBus',path='/org/freedesktop/DBus',member='NameAcquired'"
        );
    }

    #[test]
    fn escapes_single_quotes() {
        let rule = MatchRule::new().member("it's");
        assert_eq!(rule.to_string(), r"member='it'\''s'");
    }

    #[test]
    fn empty_rule_matches_everything() {
        assert_eq!(MatchRule::new().to_string(), "");
    }
}
