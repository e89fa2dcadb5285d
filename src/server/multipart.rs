//! Just enough `multipart/form-data` to pull one uploaded file out of a body.

const HEADER_END: &[u8] = b"\r\n\r\n";

/// One file part of a form body, borrowed from it.
#[derive(Debug, PartialEq, Eq)]
pub struct FilePart<'a> {
    pub field: Option<String>,
    pub filename: Option<String>,
    /// The part's own `Content-Type`, as declared by the client.
    pub content_type: Option<String>,
    pub data: &'a [u8],
}

/// Returns the index of the first occurrence of `needle` in `haystack`.
pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits `haystack` on every occurrence of `needle`.
fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut result = Vec::new();
    let mut start = 0;
    while let Some(pos) = find_subsequence(&haystack[start..], needle) {
        result.push(&haystack[start..start + pos]);
        start += pos + needle.len();
    }
    result.push(&haystack[start..]);
    result
}

/// Boundary token of a `multipart/form-data; boundary=...` content type.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';').map(str::trim);
    if !params.next()?.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|boundary| boundary.trim_matches('"').to_owned())
        .filter(|boundary| !boundary.is_empty())
}

/// The upload in field `field`, else the first part carrying a filename.
pub fn file_part<'a>(body: &'a [u8], boundary: &str, field: &str) -> Option<FilePart<'a>> {
    let delimiter = format!("--{boundary}");
    let mut parts = split_on(body, delimiter.as_bytes())
        .into_iter()
        .filter_map(parse_part)
        .filter(|part| part.filename.is_some())
        .collect::<Vec<_>>();

    let named = parts
        .iter()
        .position(|part| part.field.as_deref() == Some(field))
        .unwrap_or(0);
    (!parts.is_empty()).then(|| parts.swap_remove(named))
}

fn parse_part(part: &[u8]) -> Option<FilePart<'_>> {
    let header_end = find_subsequence(part, HEADER_END)?;
    let headers = String::from_utf8_lossy(&part[..header_end]);
    let raw = &part[header_end + HEADER_END.len()..];
    let data = raw.strip_suffix(b"\r\n").unwrap_or(raw);

    let mut file = FilePart {
        field: None,
        filename: None,
        content_type: None,
        data,
    };
    for line in headers.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            file.field = disposition_param(value, "name");
            file.filename = disposition_param(value, "filename");
        } else if name.eq_ignore_ascii_case("content-type") {
            file.content_type = Some(value.to_owned());
        }
    }

    Some(file)
}

/// `key="value"` out of a `Content-Disposition` header value.
fn disposition_param(value: &str, key: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        (name.trim() == key).then(|| value.trim().trim_matches('"').to_owned())
    })
}
