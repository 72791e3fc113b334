//! Hostname canonicalization.
//!
//! Clients stuff all kinds of metadata into the handshake's server-address
//! field: Forge appends a NUL-separated mod-list marker, "infinity filter"
//! clients append a backslash suffix, TCPShield appends `///` plus
//! metadata, SRV-resolving clients may send the `_minecraft._tcp.` label
//! pair, and DNS tooling leaves a root-zone dot. Every lookup runs through
//! this chain before touching the table.
//!
//! The chain is idempotent: `normalize(normalize(x)) == normalize(x)` for
//! every input. That forces two deviations from the naive reading of the
//! steps: trailing dots are trimmed exhaustively (after marker
//! truncation), and the SRV prefix match is case-insensitive and repeated.

/// SRV service/proto label pair clients sometimes leak into the handshake.
const SRV_PREFIX: &str = "_minecraft._tcp.";

/// TCPShield real-hostname separator.
const TCPSHIELD_MARKER: &str = "///";

/// Canonicalize a requested hostname.
pub fn normalize(raw: &str, simplify_srv: bool) -> String {
    let mut s = raw;

    // Forge appends "\0FML\0"-style suffixes.
    if let Some(idx) = s.find('\0') {
        s = &s[..idx];
    }

    // "Infinity filter" clients append a backslash suffix.
    if let Some(idx) = s.find('\\') {
        s = &s[..idx];
    }

    // TCPShield-style "real-hostname///metadata".
    if let Some(idx) = s.find(TCPSHIELD_MARKER) {
        s = &s[..idx];
    }

    // DNS root-zone dot.
    let mut s = s.trim_end_matches('.');

    if simplify_srv {
        while s
            .get(..SRV_PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(SRV_PREFIX))
        {
            s = &s[SRV_PREFIX.len()..];
        }
    }

    s.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forge_suffix_stripped() {
        assert_eq!(
            normalize("mc.example.com\0FML3\0", false),
            "mc.example.com"
        );
    }

    #[test]
    fn test_backslash_suffix_stripped() {
        assert_eq!(normalize("mc.example.com\\extra", false), "mc.example.com");
    }

    #[test]
    fn test_trailing_dot_and_case() {
        assert_eq!(normalize("MC.Example.Com.", false), "mc.example.com");
    }

    #[test]
    fn test_tcpshield_marker_stripped() {
        assert_eq!(
            normalize("mc.example.com///1.2.3.4:12345", false),
            "mc.example.com"
        );
    }

    #[test]
    fn test_marker_then_trailing_dot() {
        // The dot only becomes trailing once the marker suffix is gone.
        assert_eq!(normalize("mc.example.com.///meta", false), "mc.example.com");
    }

    #[test]
    fn test_srv_prefix_gated() {
        assert_eq!(
            normalize("_minecraft._tcp.mc.example.com", true),
            "mc.example.com"
        );
        assert_eq!(
            normalize("_minecraft._tcp.mc.example.com", false),
            "_minecraft._tcp.mc.example.com"
        );
    }

    #[test]
    fn test_srv_prefix_case_insensitive() {
        assert_eq!(
            normalize("_MineCraft._TCP.MC.Example.Com", true),
            "mc.example.com"
        );
    }

    #[test]
    fn test_srv_after_forge() {
        assert_eq!(
            normalize("_minecraft._tcp.mc.example.com\0FML3\0", true),
            "mc.example.com"
        );
    }

    #[test]
    fn test_idempotence() {
        let corpus = [
            "mc.example.com",
            "MC.Example.Com.",
            "mc.example.com\0FML3\0",
            "mc.example.com\\\\",
            "mc.example.com.///1.2.3.4",
            "_minecraft._tcp.mc.example.com",
            "_MINECRAFT._TCP._minecraft._tcp.mc.example.com",
            "mc.example.com...",
            "...",
            "",
            "\0",
            "\\",
            "///",
            "_minecraft._tcp.",
            "_minecraft._tcp",
            "a\0b\\c///d.",
            "ünïcode.example",
            "UPPER\0lower",
        ];
        for gated in [false, true] {
            for raw in corpus {
                let once = normalize(raw, gated);
                let twice = normalize(&once, gated);
                assert_eq!(once, twice, "not idempotent for {raw:?} (srv={gated})");
            }
        }
    }

    #[test]
    fn test_empty_results() {
        assert_eq!(normalize("", false), "");
        assert_eq!(normalize("\0anything", false), "");
        assert_eq!(normalize(".", false), "");
    }
}
