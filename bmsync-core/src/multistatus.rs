use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;

use crate::client::DavError;

const NS_DAV: &[u8] = b"DAV:";
const NS_OWNCLOUD: &[u8] = b"http://owncloud.org/ns";

/// One `<d:response>` element of a PROPFIND multistatus body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropResponse {
    /// Raw href as sent by the server (still percent-encoded).
    pub href: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Contents of every `<oc:checksum>` element.
    pub checksums: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ns {
    Dav,
    OwnCloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Href,
    Etag,
    LastModified,
    Checksum,
}

fn field_for(ns: Option<Ns>, local_name: &[u8]) -> Option<Field> {
    match (ns?, local_name) {
        (Ns::Dav, b"href") => Some(Field::Href),
        (Ns::Dav, b"getetag") => Some(Field::Etag),
        (Ns::Dav, b"getlastmodified") => Some(Field::LastModified),
        (Ns::OwnCloud, b"checksum") => Some(Field::Checksum),
        _ => None,
    }
}

fn namespace_of(resolved: &ResolveResult<'_>) -> Option<Ns> {
    match resolved {
        ResolveResult::Bound(Namespace(ns)) if *ns == NS_DAV => Some(Ns::Dav),
        ResolveResult::Bound(Namespace(ns)) if *ns == NS_OWNCLOUD => Some(Ns::OwnCloud),
        _ => None,
    }
}

fn xml_error(err: impl std::fmt::Display) -> DavError {
    DavError::Xml(err.to_string())
}

pub fn parse_multistatus(xml: &str) -> Result<Vec<PropResponse>, DavError> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut responses = Vec::new();
    let mut current: Option<PropResponse> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        let (resolved, event) = reader.read_resolved_event().map_err(xml_error)?;
        let ns = namespace_of(&resolved);
        match event {
            Event::Start(start) => {
                let local = start.local_name();
                if ns == Some(Ns::Dav) && local.as_ref() == b"response" {
                    current = Some(PropResponse::default());
                } else if current.is_some() {
                    field = field_for(ns, local.as_ref());
                    text.clear();
                }
            }
            Event::Text(chunk) => {
                if field.is_some() {
                    text.push_str(&chunk.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(chunk) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(&chunk));
                }
            }
            Event::End(end) => {
                let local = end.local_name();
                if ns == Some(Ns::Dav) && local.as_ref() == b"response" {
                    if let Some(done) = current.take() {
                        responses.push(done);
                    }
                    field = None;
                    continue;
                }
                let Some(active) = field else {
                    continue;
                };
                if field_for(ns, local.as_ref()) != Some(active) {
                    continue;
                }
                if let Some(response) = current.as_mut() {
                    let value = text.trim().to_string();
                    match active {
                        Field::Href => response.href = value,
                        Field::Etag if !value.is_empty() => response.etag = Some(value),
                        Field::LastModified if !value.is_empty() => {
                            response.last_modified = Some(value)
                        }
                        Field::Checksum if !value.is_empty() => response.checksums.push(value),
                        _ => {}
                    }
                }
                field = None;
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(responses)
}

/// Strips one pair of surrounding double quotes, as servers send ETags quoted.
pub fn trim_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(value)
}

/// Extracts the lowercase SHA-1 hex digest from an ownCloud checksum list such
/// as `"SHA1:abc MD5:def"`.
pub fn sha1_from_checksums<'a>(checksums: impl IntoIterator<Item = &'a str>) -> Option<String> {
    checksums
        .into_iter()
        .flat_map(str::split_whitespace)
        .find_map(|token| {
            let (algorithm, digest) = token.split_once(':')?;
            if algorithm.eq_ignore_ascii_case("sha1") && !digest.trim().is_empty() {
                Some(digest.trim().to_ascii_lowercase())
            } else {
                None
            }
        })
}
