//! Text extraction for uploaded files. Every extractor is a pure function of
//! the input bytes.

use std::io::{Cursor, Read};

use parley_core::error::{ParleyError, Result};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Txt,
    Docx,
}

impl DocumentFormat {
    /// Case-insensitive; a leading dot is ignored.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" => Some(Self::Txt),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Txt => "txt",
            Self::Docx => "docx",
        }
    }
}

/// Extension of a file name, without the dot.
pub fn extension_of(file_name: &str) -> Option<&str> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

pub fn extract_text(format: DocumentFormat, bytes: &[u8]) -> Result<String> {
    match format {
        DocumentFormat::Txt => extract_txt(bytes),
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
    }
}

fn extract_txt(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ParleyError::validation(format!("text file is not valid UTF-8: {}", e)))
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed inputs instead of returning an error.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ParleyError::validation(format!("unreadable pdf: {}", e))),
        Err(_) => Err(ParleyError::validation("unreadable pdf")),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ParleyError::validation(format!("unreadable docx: {}", e)))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ParleyError::validation(format!("docx has no document part: {}", e)))?
        .read_to_string(&mut xml)
        .map_err(|e| ParleyError::validation(format!("unreadable docx document part: {}", e)))?;

    docx_xml_to_text(&xml)
}

/// Text of `word/document.xml`. Runs are concatenated; paragraphs, `w:br`
/// and `w:cr` become newlines and `w:tab` a tab, whatever their attributes.
fn docx_xml_to_text(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text = false;
    // `w:tab` inside `w:tabs` is a tab stop definition, not content.
    let mut in_tab_stops = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ParleyError::validation(format!("malformed docx xml: {}", e)))?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"w:t" => in_text = true,
                b"w:tabs" => in_tab_stops = true,
                b"w:tab" if !in_tab_stops => out.push('\t'),
                b"w:br" | b"w:cr" => out.push('\n'),
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"w:tab" if !in_tab_stops => out.push('\t'),
                b"w:br" | b"w:cr" => out.push('\n'),
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:tabs" => in_tab_stops = false,
                b"w:p" => out.push('\n'),
                _ => {}
            },
            Event::Text(e) if in_text => {
                let text = e
                    .decode()
                    .map_err(|e| ParleyError::validation(format!("malformed docx text: {}", e)))?;
                out.push_str(&text);
            }
            Event::GeneralRef(r) if in_text => push_reference(&mut out, &r)?,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out.trim_end().to_string())
}

/// Character references (`&#8217;`, `&#x2019;`) and the predefined XML
/// entities. Unknown entities are kept verbatim.
fn push_reference(out: &mut String, reference: &BytesRef<'_>) -> Result<()> {
    let invalid = |e: String| ParleyError::validation(format!("malformed docx reference: {}", e));

    if let Some(ch) = reference.resolve_char_ref().map_err(|e| invalid(e.to_string()))? {
        out.push(ch);
        return Ok(());
    }
    let name = reference.decode().map_err(|e| invalid(e.to_string()))?;
    match resolve_predefined_entity(&name) {
        Some(value) => out.push_str(value),
        None => {
            out.push('&');
            out.push_str(&name);
            out.push(';');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_bytes(document_xml: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("word/document.xml", options).unwrap();
            writer.write_all(document_xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::from_extension("PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension(".txt"), Some(DocumentFormat::Txt));
        assert_eq!(DocumentFormat::from_extension("Docx"), Some(DocumentFormat::Docx));
        assert_eq!(DocumentFormat::from_extension("exe"), None);
        assert_eq!(DocumentFormat::from_extension(""), None);
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("report.final.PDF"), Some("PDF"));
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of(".bashrc"), None);
        assert_eq!(extension_of("trailing."), None);
    }

    #[test]
    fn test_txt_strips_bom_and_rejects_invalid_utf8() {
        assert_eq!(extract_text(DocumentFormat::Txt, b"\xEF\xBB\xBFhello").unwrap(), "hello");
        let err = extract_text(DocumentFormat::Txt, &[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_docx_runs_paragraphs_and_entities() {
        let xml = r#"<?xml version="1.0"?><w:document><w:body>
            <w:p><w:r><w:t>Roses &amp; tulips</w:t></w:r><w:r><w:t xml:space="preserve"> bloom</w:t></w:r></w:p>
            <w:p><w:r><w:t>a</w:t><w:tab/><w:t>b</w:t><w:br/><w:t>&lt;c&gt;</w:t></w:r></w:p>
            </w:body></w:document>"#;
        let text = extract_text(DocumentFormat::Docx, &docx_bytes(xml)).unwrap();
        assert_eq!(text, "Roses & tulips bloom\na\tb\n<c>");
    }

    #[test]
    fn test_docx_breaks_with_attributes_and_character_references() {
        let xml = r#"<w:document><w:body><w:p><w:r>
            <w:t>Chapter one</w:t><w:br w:type="page"/><w:t>Chapter two</w:t>
            <w:cr/><w:t>It&#8217;s here &#x2014; &amp; there</w:t>
            </w:r></w:p></w:body></w:document>"#;
        let text = extract_text(DocumentFormat::Docx, &docx_bytes(xml)).unwrap();
        assert_eq!(text, "Chapter one\nChapter two\nIt\u{2019}s here \u{2014} & there");
    }

    #[test]
    fn test_docx_tab_stops_are_not_content() {
        let xml = r#"<w:document><w:body><w:p>
            <w:pPr><w:tabs><w:tab w:val="left" w:pos="720"/></w:tabs></w:pPr>
            <w:r><w:t>left</w:t><w:tab/><w:t>right</w:t></w:r>
            </w:p></w:body></w:document>"#;
        let text = extract_text(DocumentFormat::Docx, &docx_bytes(xml)).unwrap();
        assert_eq!(text, "left\tright");
    }

    #[test]
    fn test_malformed_containers_are_validation_errors() {
        assert!(extract_text(DocumentFormat::Docx, b"not a zip").unwrap_err().is_validation());
        assert!(extract_text(DocumentFormat::Pdf, b"not a pdf").unwrap_err().is_validation());
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let bytes = docx_bytes("<w:p><w:t>same</w:t></w:p>");
        assert_eq!(
            extract_text(DocumentFormat::Docx, &bytes).unwrap(),
            extract_text(DocumentFormat::Docx, &bytes).unwrap()
        );
    }
}
