use super::FirmwareFamily;

/// Family signatures in priority order. The first signature found in a binary decides its family.
pub const SIGNATURES: &[(&str, FirmwareFamily)] = &[
    ("End of English", FirmwareFamily::OfficialEnglish),
    ("XTOS", FirmwareFamily::OfficialChinese),
    ("CrossPoint-ESP32-", FirmwareFamily::CrossPoint),
    ("Starting CrossPoint version", FirmwareFamily::CrossPoint),
];

/// Encodes `pattern` with one byte per character (ISO-8859-1).
///
/// Returns `None` if the pattern contains a character that has no single-byte encoding, since such
/// a pattern can never appear in the binary.
fn encode_single_byte(pattern: &str) -> Option<Vec<u8>> {
    pattern
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

/// Returns true if the byte encoding of `pattern` occurs anywhere in `data`.
///
/// The comparison is byte-exact; no normalization of any kind takes place.
pub fn contains_signature(data: &[u8], pattern: &str) -> bool {
    let needle = match encode_single_byte(pattern) {
        Some(needle) => needle,
        None => return false,
    };

    if needle.is_empty() || data.len() < needle.len() {
        return false;
    }

    data.windows(needle.len()).any(|window| window == needle.as_slice())
}

/// Determines the firmware family of `data` by searching for the known signatures.
pub fn classify(data: &[u8]) -> FirmwareFamily {
    SIGNATURES
        .iter()
        .find(|(pattern, _)| contains_signature(data, pattern))
        .map(|&(_, family)| family)
        .unwrap_or(FirmwareFamily::Unknown)
}
