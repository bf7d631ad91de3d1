//! Object naming for derived artifacts.

/// Maximum length of a DNS-1123 subdomain object name.
pub const MAX_NAME_LEN: usize = 253;
/// Length kept from an over-long name before the hash suffix is appended.
const TRUNCATE_TO: usize = 240;
const MAX_LABEL_LEN: usize = 63;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Stable 32-bit digest of a name: FNV-1a with both halves folded together.
fn name_digest(name: &str) -> u32 {
    let h = name.bytes().fold(FNV_OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME));
    ((h >> 32) ^ h) as u32
}

/// Lowercase, map everything outside `[a-z0-9-]` to `-`, collapse dash runs and
/// trim dashes at both ends. Names longer than 253 characters are cut to 240 and
/// suffixed with `-` and 8 hex digits of a hash of the full sanitized name.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_dash = true;
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' {
            if prev_dash { continue; }
            prev_dash = true;
        } else {
            prev_dash = false;
        }
        out.push(c);
    }
    while out.ends_with('-') { out.pop(); }
    if out.len() > MAX_NAME_LEN {
        let digest = name_digest(&out);
        let head = out[..TRUNCATE_TO].trim_end_matches('-');
        out = format!("{}-{:08x}", head, digest);
    }
    out
}

/// Name of the cached values artifact for one chart version of a repository.
pub fn artifact_name(repository: &str, chart: &str, version: &str) -> String {
    sanitize_name(&format!("helm-values-{}-{}-{}", repository, chart, version))
}

/// Coerce an arbitrary string into a valid label value (`[A-Za-z0-9._-]`, at most
/// 63 characters, alphanumeric at both ends).
pub fn sanitize_label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '-' })
        .collect();
    let cut = if mapped.len() > MAX_LABEL_LEN { &mapped[..MAX_LABEL_LEN] } else { mapped.as_str() };
    cut.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}
