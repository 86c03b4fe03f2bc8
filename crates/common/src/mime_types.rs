/// Derive the MIME type from the client-supplied filename extension. This is
/// the only MIME derivation in the system; content sniffing is intentionally
/// not done.
pub fn mime_from_filename(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
