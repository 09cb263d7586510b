//! `multipart/form-data` decoding for transcription uploads.

use bytes::Bytes;

use super::RelayError;

#[derive(Debug, Clone)]
pub(crate) struct MultipartPart {
    pub(crate) name: String,
    pub(crate) filename: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) data: Bytes,
}

impl MultipartPart {
    fn text(&self) -> Result<String, RelayError> {
        String::from_utf8(self.data.to_vec())
            .map_err(|_| bind_error(format!("field `{}` is not valid utf-8", self.name)))
    }
}

/// Uploaded file of a transcription request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl UploadedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Bound `/v1/audio/transcriptions` form. Only `file` and `model` are required.
#[derive(Debug, Clone)]
pub struct TranscriptionForm {
    pub file: UploadedFile,
    pub model: String,
    pub prompt: String,
    pub response_format: String,
    pub temperature: f64,
    pub language: String,
}

pub(crate) fn bind_error(reason: impl Into<String>) -> RelayError {
    RelayError::Bind {
        reason: reason.into(),
    }
}

pub fn bind_transcription_form(
    content_type: &str,
    body: &Bytes,
) -> Result<TranscriptionForm, RelayError> {
    if !content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return Err(bind_error(format!(
            "unsupported content type: {content_type}"
        )));
    }

    let mut file = None;
    let mut model = None;
    let mut prompt = String::new();
    let mut response_format = String::new();
    let mut temperature = 0.0;
    let mut language = String::new();

    for part in parse_multipart_form(content_type, body)? {
        match part.name.as_str() {
            "file" => {
                file = Some(UploadedFile {
                    filename: part.filename.clone().unwrap_or_else(|| "file".to_string()),
                    content_type: part.content_type.clone(),
                    data: part.data.clone(),
                });
            }
            "model" => model = Some(part.text()?),
            "prompt" => prompt = part.text()?,
            "response_format" => response_format = part.text()?,
            "language" => language = part.text()?,
            "temperature" => {
                let raw = part.text()?;
                let raw = raw.trim();
                if !raw.is_empty() {
                    temperature = raw
                        .parse::<f64>()
                        .map_err(|_| bind_error(format!("invalid temperature: {raw}")))?;
                }
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| bind_error("missing form field `file`"))?;
    let model = model
        .filter(|model| !model.trim().is_empty())
        .ok_or_else(|| bind_error("missing form field `model`"))?;

    Ok(TranscriptionForm {
        file,
        model,
        prompt,
        response_format,
        temperature,
        language,
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(start);
    }
    haystack
        .get(start..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| start + offset)
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

fn multipart_boundary(content_type: &str) -> Result<String, RelayError> {
    content_type
        .split(';')
        .map(str::trim)
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim().eq_ignore_ascii_case("boundary").then(|| unquote(value))
        })
        .find(|boundary| !boundary.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| bind_error("multipart boundary is missing"))
}

fn skip_line_break(bytes: &[u8], cursor: usize) -> usize {
    if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
        cursor + 2
    } else if bytes.get(cursor..cursor + 1) == Some(b"\n") {
        cursor + 1
    } else {
        cursor
    }
}

pub(crate) fn parse_multipart_form(
    content_type: &str,
    body: &Bytes,
) -> Result<Vec<MultipartPart>, RelayError> {
    let boundary = multipart_boundary(content_type)?;
    let marker = format!("--{boundary}");
    let delimiter = format!("\r\n{marker}");

    let bytes = body.as_ref();
    let mut cursor = find_subslice(bytes, marker.as_bytes(), 0)
        .ok_or_else(|| bind_error("multipart body missing boundary marker"))?
        + marker.len();

    let mut parts = Vec::new();
    while bytes.get(cursor..cursor + 2) != Some(b"--") {
        cursor = skip_line_break(bytes, cursor);

        let (headers_end, separator_len) = find_subslice(bytes, b"\r\n\r\n", cursor)
            .map(|idx| (idx, 4))
            .or_else(|| find_subslice(bytes, b"\n\n", cursor).map(|idx| (idx, 2)))
            .ok_or_else(|| bind_error("multipart part missing header separator"))?;

        let mut name = None;
        let mut filename = None;
        let mut part_content_type = None;
        for line in String::from_utf8_lossy(&bytes[cursor..headers_end]).lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for item in value.split(';').map(str::trim) {
                    if let Some(raw) = item.strip_prefix("name=") {
                        name = Some(unquote(raw).to_string());
                    } else if let Some(raw) = item.strip_prefix("filename=") {
                        filename = Some(unquote(raw).to_string());
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") && !value.is_empty() {
                part_content_type = Some(value.to_string());
            }
        }

        let name = name.ok_or_else(|| bind_error("multipart part missing content-disposition name"))?;
        let data_start = headers_end + separator_len;
        let data_end = find_subslice(bytes, delimiter.as_bytes(), data_start)
            .ok_or_else(|| bind_error("multipart part missing trailing boundary"))?;

        parts.push(MultipartPart {
            name,
            filename,
            content_type: part_content_type,
            data: body.slice(data_start..data_end),
        });

        cursor = data_end + delimiter.len();
    }

    Ok(parts)
}
