//! Object key generation from a template
//!
//! Keys are `prefix + template` with the first `{seq}` or `{seq:N}` marker
//! replaced by the sequence number, zero-padded to width N when given.
//! Malformed markers degrade to an unpadded decimal rather than failing.

/// Maps sequence indices in `[0, count)` to stable key strings.
pub struct KeySpace {
    prefix: String,
    template: String,
    count: usize,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>, template: impl Into<String>, count: usize) -> Self {
        KeySpace {
            prefix: prefix.into(),
            template: template.into(),
            count,
        }
    }

    /// Render the key for a sequence number.
    pub fn generate(&self, seq: usize) -> String {
        format!("{}{}", self.prefix, render_template(&self.template, seq))
    }

    /// Total number of keys in the keyspace.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn render_template(template: &str, seq: usize) -> String {
    let Some(start) = template.find("{seq") else {
        return template.to_string();
    };
    let Some(end) = template[start..].find('}').map(|i| start + i) else {
        // Unclosed marker: leave the template untouched.
        return template.to_string();
    };

    let marker = &template[start..=end];
    let formatted = if marker == "{seq}" {
        seq.to_string()
    } else if let Some(width_str) = marker.strip_prefix("{seq:").and_then(|m| m.strip_suffix('}')) {
        match width_str.parse::<usize>() {
            Ok(width) if width > 0 => format!("{:0width$}", seq, width = width),
            _ => seq.to_string(),
        }
    } else {
        seq.to_string()
    };

    format!("{}{}{}", &template[..start], formatted, &template[end + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_template() {
        let ks = KeySpace::new("bench/", "obj-{seq:08}.bin", 100);
        assert_eq!(ks.generate(42), "bench/obj-00000042.bin");
        assert_eq!(ks.generate(0), "bench/obj-00000000.bin");
    }

    #[test]
    fn test_unpadded_template() {
        let ks = KeySpace::new("bench/", "obj-{seq}.bin", 100);
        assert_eq!(ks.generate(42), "bench/obj-42.bin");
    }

    #[test]
    fn test_no_marker() {
        let ks = KeySpace::new("bench/", "fixed.bin", 1);
        assert_eq!(ks.generate(42), "bench/fixed.bin");
    }

    #[test]
    fn test_empty_prefix() {
        let ks = KeySpace::new("", "obj-{seq:04}.bin", 10);
        assert_eq!(ks.generate(7), "obj-0007.bin");
    }

    #[test]
    fn test_width_shorter_than_number() {
        let ks = KeySpace::new("", "obj-{seq:02}.bin", 1000);
        assert_eq!(ks.generate(12345), "obj-12345.bin");
    }

    #[test]
    fn test_malformed_markers_degrade() {
        // Non-numeric width falls back to unpadded decimal.
        let ks = KeySpace::new("", "obj-{seq:xy}.bin", 10);
        assert_eq!(ks.generate(5), "obj-5.bin");

        // Zero width falls back too.
        let ks = KeySpace::new("", "obj-{seq:0}.bin", 10);
        assert_eq!(ks.generate(5), "obj-5.bin");

        // Unclosed brace leaves the template unchanged.
        let ks = KeySpace::new("p/", "obj-{seq:08.bin", 10);
        assert_eq!(ks.generate(5), "p/obj-{seq:08.bin");
    }

    #[test]
    fn test_only_first_marker_replaced() {
        let ks = KeySpace::new("", "{seq}-{seq}.bin", 10);
        assert_eq!(ks.generate(3), "3-{seq}.bin");
    }
}
