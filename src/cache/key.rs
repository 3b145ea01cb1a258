//! Cache key templates
//!
//! A key template such as `deps-{os}-{runtime}-{branch}-v{generation}` is
//! rendered against a variable binding. Rendering is a pure function of the
//! template and the variables, so identical bindings always produce the same
//! key. The storage slot is the SHA-256 of the rendered key, which keeps
//! distinct keys distinct on disk regardless of the characters they contain.

use crate::error::{RiggerError, RiggerResult};
use crate::matrix::Binding;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Key variables rigger supplies itself; matrix axes may not reuse them
pub const BUILTIN_KEY_VARS: [&str; 4] = ["branch", "generation", "package", "os_family"];

/// Variables available to a key template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyVars(BTreeMap<String, String>);

impl KeyVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables for one cell: every axis plus branch and generation
    pub fn for_cell(binding: &Binding, branch: &str, generation: u32) -> Self {
        let mut vars = Self::new();
        for (axis, value) in binding.iter() {
            vars.set(axis, value);
        }
        vars.set("branch", branch);
        vars.set("generation", &generation.to_string());
        vars
    }

    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// A cache key template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    template: String,
}

impl CacheKey {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Substitute `{name}` placeholders; `{{` and `}}` are literal braces
    pub fn render(&self, vars: &KeyVars) -> RiggerResult<String> {
        let mut out = String::with_capacity(self.template.len());
        let mut chars = self.template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(self.invalid("unterminated placeholder")),
                        }
                    }
                    let name = name.trim();
                    let value = vars
                        .get(name)
                        .ok_or_else(|| self.invalid(format!("unknown variable '{name}'")))?;
                    out.push_str(value);
                }
                '}' => return Err(self.invalid("unmatched '}'")),
                c => out.push(c),
            }
        }

        if out.is_empty() {
            return Err(self.invalid("renders to an empty key"));
        }

        Ok(out)
    }

    /// Check the template against the variable names it will be given
    pub fn validate(&self, vars: &KeyVars) -> RiggerResult<()> {
        self.render(vars).map(|_| ())
    }

    fn invalid(&self, reason: impl Into<String>) -> RiggerError {
        RiggerError::CacheKeyTemplate {
            template: self.template.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Storage slot for a rendered key (hex SHA-256)
pub fn key_digest(rendered: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rendered.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(os: &str, branch: &str) -> KeyVars {
        let binding = Binding::new(vec![
            ("os".to_string(), os.to_string()),
            ("runtime".to_string(), "3.8".to_string()),
        ]);
        KeyVars::for_cell(&binding, branch, 2)
    }

    #[test]
    fn renders_placeholders() {
        let key = CacheKey::new("deps-{os}-{runtime}-{branch}-v{generation}");
        assert_eq!(
            key.render(&vars("linux", "main")).unwrap(),
            "deps-linux-3.8-main-v2"
        );
    }

    #[test]
    fn identical_bindings_render_identically() {
        let key = CacheKey::new("deps-{os}-{branch}");
        let a = key.render(&vars("macos", "feature/x")).unwrap();
        let b = key.render(&vars("macos", "feature/x")).unwrap();
        assert_eq!(a, b);
        assert_eq!(key_digest(&a), key_digest(&b));
    }

    #[test]
    fn distinct_bindings_do_not_collide() {
        let key = CacheKey::new("deps-{branch}");
        let a = key.render(&vars("linux", "a/b")).unwrap();
        let b = key.render(&vars("linux", "a_b")).unwrap();
        assert_ne!(a, b);
        assert_ne!(key_digest(&a), key_digest(&b));
    }

    #[test]
    fn unused_variables_are_shared_by_design() {
        // A key without {os} is deliberately shared across operating systems.
        let key = CacheKey::new("deps-{branch}");
        assert_eq!(
            key.render(&vars("linux", "main")).unwrap(),
            key.render(&vars("windows", "main")).unwrap()
        );
    }

    #[test]
    fn escaped_braces() {
        let key = CacheKey::new("{{literal}}-{os}");
        assert_eq!(key.render(&vars("linux", "main")).unwrap(), "{literal}-linux");
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let key = CacheKey::new("deps-{python}");
        let err = key.render(&vars("linux", "main")).unwrap_err();
        assert!(err.to_string().contains("unknown variable 'python'"));
    }

    #[test]
    fn malformed_templates() {
        assert!(CacheKey::new("deps-{os").render(&vars("linux", "main")).is_err());
        assert!(CacheKey::new("deps-os}").render(&vars("linux", "main")).is_err());
        assert!(CacheKey::new("").render(&vars("linux", "main")).is_err());
    }

    #[test]
    fn digest_is_full_sha256() {
        assert_eq!(key_digest("x").len(), 64);
    }
}
