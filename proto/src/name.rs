use unicode_normalization::UnicodeNormalization;

/// NFC-normalize and trim a node name. Uniqueness checks and the trash/recover
/// round trip both compare names through this function so that visually
/// identical names never collide or fail to collide due to composition form.
pub fn normalize_name(name: &str) -> String { name.trim().nfc().collect::<String>() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_normalizes() {
        assert_eq!(normalize_name("  Docs  "), "Docs");
        // e + combining acute vs precomposed é both normalize to the same NFC form
        let decomposed = "cafe\u{0301}";
        let precomposed = "café";
        assert_eq!(normalize_name(decomposed), normalize_name(precomposed));
    }
}
