use std::{any::type_name_of_val, fmt::Debug, io::BufRead};

use compact_str::CompactString;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use tracing::instrument;

// tags we need a value of, and their parents
#[derive(PartialEq, Eq)]
enum Tag {
    MediaWiki,   // <mediawiki version="0.11" xml:lang="en">...</mediawiki> is the root tag
    SiteInfo,    // <siteinfo><sitename>Wikipedia</sitename><dbname>enwiki</dbname>...</siteinfo>
    DbName,      // <dbname>enwiki</dbname>
    Page,        // <page>...tags are (title, ns, id, revision)</page>
    Title,       // <title>Venezuela</title>
    Ns,          // <ns>0</ns>
    Id,          // <id>32374</id>
    Revision,    // <revision>...tags are (id, parentid, timestamp, contributor, comment, text, sha1)</revision>
    Timestamp,   // <timestamp>2004-08-05T02:30:31Z</timestamp>
    Contributor, // <contributor><username>blah</username><id>500</id></contributor> or <contributor><ip>1.2.3.4</ip></contributor>
    Username,    // <username>blah</username>
    Ip,          // <ip>1.2.3.4</ip>
    Text(TextAttributes), // <text bytes="20" xml:space="preserve">blah</text> or <text bytes="20" deleted="deleted" />
    Sha1,        // <sha1>3h3w...</sha1>
    Comment,     // <comment>blah</comment>
    Minor,       // <minor />
    Other(CompactString), // parentid, model, format, sitename, ...
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TextAttributes {
    bytes: Option<u64>,
    xml_space: Option<CompactString>,
    deleted: bool,
}

impl Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tag::MediaWiki => write!(f, "<mediawiki>"),
            Tag::SiteInfo => write!(f, "<siteinfo>"),
            Tag::DbName => write!(f, "<dbname>"),
            Tag::Page => write!(f, "<page>"),
            Tag::Title => write!(f, "<title>"),
            Tag::Ns => write!(f, "<ns>"),
            Tag::Id => write!(f, "<id>"),
            Tag::Revision => write!(f, "<revision>"),
            Tag::Timestamp => write!(f, "<timestamp>"),
            Tag::Contributor => write!(f, "<contributor>"),
            Tag::Username => write!(f, "<username>"),
            Tag::Ip => write!(f, "<ip>"),
            Tag::Text(attributes) => {
                write!(f, "<text")?;
                if let Some(bytes) = attributes.bytes {
                    write!(f, " bytes={}", bytes)?;
                }
                if attributes.deleted {
                    write!(f, " deleted")?;
                }
                write!(f, ">")
            }
            Tag::Sha1 => write!(f, "<sha1>"),
            Tag::Comment => write!(f, "<comment>"),
            Tag::Minor => write!(f, "<minor>"),
            Tag::Other(name) => write!(f, "<{}>", name),
        }
    }
}

impl Tag {
    fn from_start_bytes(e: &BytesStart) -> Result<Self, quick_xml::Error> {
        let tag = match e.name().as_ref() {
            b"mediawiki" => Tag::MediaWiki,
            b"siteinfo" => Tag::SiteInfo,
            b"dbname" => Tag::DbName,
            b"page" => Tag::Page,
            b"title" => Tag::Title,
            b"ns" => Tag::Ns,
            b"id" => Tag::Id,
            b"revision" => Tag::Revision,
            b"timestamp" => Tag::Timestamp,
            b"contributor" => Tag::Contributor,
            b"username" => Tag::Username,
            b"ip" => Tag::Ip,
            b"text" => {
                let mut attributes = TextAttributes::default();

                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    match attr.key.as_ref() {
                        b"bytes" => {
                            let value = attr.unescape_value()?;
                            attributes.bytes = value.trim().parse().ok();
                            if attributes.bytes.is_none() {
                                tracing::warn!(
                                    message = "Found invalid text length attribute",
                                    bytes = value.as_ref()
                                );
                            }
                        }
                        b"xml:space" => {
                            attributes.xml_space =
                                Some(CompactString::from(attr.unescape_value()?.as_ref()));
                        }
                        b"deleted" => {
                            attributes.deleted = true;
                        }
                        _ => {}
                    }
                }

                Tag::Text(attributes)
            }
            b"sha1" => Tag::Sha1,
            b"comment" => Tag::Comment,
            b"minor" => Tag::Minor,
            other => Tag::Other(CompactString::from(String::from_utf8_lossy(other).as_ref())),
        };

        Ok(tag)
    }

    fn matches_end_bytes(&self, e: &BytesEnd) -> bool {
        let name = e.name();
        match (self, name.as_ref()) {
            (Tag::MediaWiki, b"mediawiki") => true,
            (Tag::SiteInfo, b"siteinfo") => true,
            (Tag::DbName, b"dbname") => true,
            (Tag::Page, b"page") => true,
            (Tag::Title, b"title") => true,
            (Tag::Ns, b"ns") => true,
            (Tag::Id, b"id") => true,
            (Tag::Revision, b"revision") => true,
            (Tag::Timestamp, b"timestamp") => true,
            (Tag::Contributor, b"contributor") => true,
            (Tag::Username, b"username") => true,
            (Tag::Ip, b"ip") => true,
            (Tag::Text(_), b"text") => true,
            (Tag::Sha1, b"sha1") => true,
            (Tag::Comment, b"comment") => true,
            (Tag::Minor, b"minor") => true,
            (Tag::Other(expected), actual) => expected.as_bytes() == actual,
            _ => false,
        }
    }
}

/// Author of a revision. Anonymous edits only carry an `ip`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Contributor {
    pub username: Option<CompactString>,
    pub ip: Option<CompactString>,
    pub id: Option<i64>,
}

impl Contributor {
    /// Username for registered editors, the address for anonymous ones.
    pub fn name(&self) -> Option<&str> {
        self.username
            .as_deref()
            .or(self.ip.as_deref())
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Text {
    Normal(String),
    /// Suppressed revision text (`<text deleted="deleted" />`) or no `<text>` at all.
    Deleted,
}

impl Text {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Text::Normal(text) => Some(text),
            Text::Deleted => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Text::Normal(text) => Some(text),
            Text::Deleted => None,
        }
    }
}

impl Debug for Text {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Text::Normal(text) if text.len() > 64 => {
                let cut = (0..=64).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
                write!(f, "{:?}... ({} bytes)", &text[..cut], text.len())
            }
            Text::Normal(text) => write!(f, "{:?}", text),
            Text::Deleted => write!(f, "Deleted"),
        }
    }
}

/// One `<revision>` of an export document.
///
/// The timestamp is kept exactly as exported; turning it into an instant is the job of the
/// feature pipeline, which knows which format to expect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub id: i64,
    pub timestamp: CompactString,
    pub contributor: Contributor,
    pub text: Text,
    /// `bytes` attribute of `<text>`
    pub text_bytes: Option<u64>,
    /// `xml:space` attribute of `<text>`
    pub text_xml_space: Option<CompactString>,
    pub sha1: Option<CompactString>,
    pub comment: Option<String>,
    pub minor: bool,
}

#[derive(Debug, Default)]
struct RevisionBuilder {
    id: Option<i64>,
    timestamp: Option<CompactString>,
    contributor: Contributor,
    text: Option<Text>,
    text_bytes: Option<u64>,
    text_xml_space: Option<CompactString>,
    sha1: Option<CompactString>,
    comment: Option<String>,
    minor: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("missing mandatory field: {0}")]
struct BuildRevisionError(&'static str, Box<RevisionBuilder>);

impl RevisionBuilder {
    fn open_text(&mut self, attributes: &TextAttributes) {
        self.text_bytes = attributes.bytes;
        self.text_xml_space = attributes.xml_space.clone();
        self.text = Some(if attributes.deleted {
            Text::Deleted
        } else {
            Text::Normal(String::new())
        });
    }

    // `path` is relative to the enclosing <revision>
    fn record(&mut self, path: &[Tag], value: &str, position: u64) {
        match path {
            [Tag::Id] => {
                self.id = value.trim().parse().ok();
                if self.id.is_none() {
                    tracing::warn!(message = "Found invalid revision id", id = value, position);
                }
            }
            [Tag::Timestamp] => {
                self.timestamp = Some(CompactString::from(value.trim()));
            }
            [Tag::Contributor, Tag::Username] => {
                self.contributor.username = Some(CompactString::from(value));
            }
            [Tag::Contributor, Tag::Ip] => {
                self.contributor.ip = Some(CompactString::from(value));
            }
            [Tag::Contributor, Tag::Id] => {
                self.contributor.id = value.trim().parse().ok();
                if self.contributor.id.is_none() {
                    tracing::warn!(message = "Found invalid contributor id", id = value, position);
                }
            }
            [Tag::Text(_)] => {
                // entity references may split the content over several events
                if let Some(Text::Normal(text)) = &mut self.text {
                    text.push_str(value);
                }
            }
            [Tag::Sha1] => {
                self.sha1 = Some(CompactString::from(value.trim()));
            }
            [Tag::Comment] => {
                self.comment.get_or_insert_with(String::new).push_str(value);
            }
            [Tag::Minor] => {
                self.minor = true;
            }
            _ => {}
        }
    }

    fn try_build(self) -> Result<Revision, BuildRevisionError> {
        let Some(id) = self.id else {
            return Err(BuildRevisionError("id", self.into()));
        };
        let Some(timestamp) = self.timestamp.clone() else {
            return Err(BuildRevisionError("timestamp", self.into()));
        };

        Ok(Revision {
            id,
            timestamp,
            contributor: self.contributor,
            text: self.text.unwrap_or(Text::Deleted),
            text_bytes: self.text_bytes,
            text_xml_space: self.text_xml_space,
            sha1: self.sha1,
            comment: self.comment,
            minor: self.minor,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Page {
    pub title: CompactString,
    pub namespace: i32,
    pub id: Option<i64>,
    pub revisions: Vec<Revision>,
    /// `<revision>` elements left out because a mandatory field was missing.
    pub skipped_revisions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SiteInfo {
    pub dbname: CompactString,
}

#[derive(Debug, thiserror::Error)]
pub enum ParsingError {
    #[error("XML error")]
    XmlError(#[from] quick_xml::Error),
    #[error("unexpected end of file")]
    Eof,
    #[error("mismatched tags: expected closing {expected}, found </{actual}>")]
    MismatchedTag { expected: String, actual: String },
    #[error("unexpected closing tag </{0}>")]
    UnexpectedEndTag(String),
    #[error("revision is missing mandatory field `{0}`")]
    MissingField(&'static str),
}

/// Streaming reader for page-export documents (`Special:Export` output and dump files).
pub struct ExportParser<R: BufRead> {
    xml_parser: quick_xml::Reader<R>,
    buf: Vec<u8>,
    current_path: Vec<Tag>,
    site_info: SiteInfo,
}

impl<R: BufRead> Debug for ExportParser<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportParser")
            .field("xml_parser", &type_name_of_val(&self.xml_parser))
            .field("buf.len", &self.buf.len())
            .field("buf.capacity", &self.buf.capacity())
            .field("current_path", &self.current_path)
            .field("site_info", &self.site_info)
            .finish()
    }
}

fn normalize_title(title: &str) -> CompactString {
    if title.contains('_') {
        CompactString::from(title.replace('_', " "))
    } else {
        CompactString::from(title)
    }
}

impl<R: BufRead> ExportParser<R> {
    pub fn new(reader: R) -> Self {
        let mut xml_parser = quick_xml::Reader::from_reader(reader);
        // end tags are matched against `current_path` in `check_end_tag`
        xml_parser.config_mut().check_end_names = false;

        Self {
            xml_parser,
            // a batch of 1000 revisions of a long article easily reaches several MiB
            buf: Vec::with_capacity(64 * 1024),
            current_path: Vec::new(),
            site_info: SiteInfo::default(),
        }
    }

    /// Only populated once the `<siteinfo>` block has been read, i.e. after the first call to
    /// [`ExportParser::parse_page`].
    pub fn site_info(&self) -> &SiteInfo {
        &self.site_info
    }

    // takes the fields separately, the event still borrows `buf`
    fn check_end_tag(
        e: &BytesEnd,
        current_path: &mut Vec<Tag>,
        xml_parser: &quick_xml::Reader<R>,
    ) -> Result<Option<Tag>, ParsingError> {
        let Some(tag) = current_path.pop() else {
            let actual = String::from_utf8_lossy(e.name().as_ref()).into_owned();
            tracing::error!(
                message = "Unexpected end tag",
                tag = actual.as_str(),
                position = xml_parser.buffer_position()
            );
            if cfg!(feature = "strict") {
                return Err(ParsingError::UnexpectedEndTag(actual));
            }
            tracing::warn!("Ignoring unexpected end tag. This may lead to incorrect results.");
            return Ok(None);
        };

        if !tag.matches_end_bytes(e) {
            let actual = String::from_utf8_lossy(e.name().as_ref()).into_owned();
            tracing::error!(
                message = "Mismatched tags",
                expected = ?tag,
                actual = actual.as_str(),
                current_path = ?current_path,
                position = xml_parser.buffer_position()
            );
            if cfg!(feature = "strict") {
                return Err(ParsingError::MismatchedTag {
                    expected: format!("{:?}", tag),
                    actual,
                });
            }
            // can't tell a missing opening tag from a missing closing one, so just carry on
            tracing::warn!("Ignoring mismatched tag. This may lead to incorrect results.");
        }

        Ok(Some(tag))
    }

    /// Read the next `<page>` with all of its revisions.
    ///
    /// Returns `Ok(None)` if the document contains no further page. An export request past the
    /// last revision of a page yields exactly such a document.
    #[instrument(skip(self))]
    pub fn parse_page(&mut self) -> Result<Option<Page>, ParsingError> {
        let mut page = Page::default();
        let mut started_page = false;
        let mut revision_builder: Option<RevisionBuilder> = None;

        loop {
            self.buf.clear();
            let event = self.xml_parser.read_event_into(&mut self.buf)?;
            match event {
                Event::Start(ref e) => {
                    let tag = Tag::from_start_bytes(e)?;

                    match &tag {
                        Tag::Page => started_page = true,
                        Tag::Revision => revision_builder = Some(RevisionBuilder::default()),
                        Tag::Text(attributes) => {
                            if let Some(builder) = &mut revision_builder {
                                builder.open_text(attributes);
                            }
                        }
                        _ => {}
                    }

                    self.current_path.push(tag);
                }
                Event::Empty(ref e) => {
                    let tag = Tag::from_start_bytes(e)?;

                    if self.current_path.last() == Some(&Tag::Revision) {
                        if let Some(builder) = &mut revision_builder {
                            match &tag {
                                Tag::Text(attributes) => builder.open_text(attributes),
                                Tag::Minor => builder.minor = true,
                                _ => {}
                            }
                        }
                    }
                }
                Event::Text(e) => {
                    let text = e.unescape()?;

                    use Tag::*;

                    match self.current_path.as_slice() {
                        [MediaWiki, SiteInfo, DbName] => {
                            self.site_info.dbname = CompactString::from(text.as_ref());
                        }
                        [MediaWiki, Page, Title] => {
                            page.title = normalize_title(&text);
                        }
                        [MediaWiki, Page, Ns] => {
                            page.namespace = text.trim().parse().unwrap_or_else(|_| {
                                tracing::warn!(
                                    message = "Found invalid namespace id, defaulting to 0",
                                    ns = text.as_ref(),
                                    position = self.xml_parser.buffer_position()
                                );
                                0
                            });
                        }
                        [MediaWiki, Page, Id] => {
                            page.id = text.trim().parse().ok();
                        }
                        [MediaWiki, Page, Revision, rest @ ..] => {
                            if let Some(builder) = &mut revision_builder {
                                builder.record(rest, &text, self.xml_parser.buffer_position() as u64);
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) => {
                    let tag = Self::check_end_tag(e, &mut self.current_path, &self.xml_parser)?;

                    match tag {
                        Some(Tag::Revision) => {
                            let Some(builder) = revision_builder.take() else {
                                continue;
                            };
                            match builder.try_build() {
                                Ok(revision) => page.revisions.push(revision),
                                Err(BuildRevisionError(field, partial_revision)) => {
                                    tracing::error!(
                                        message = "Missing mandatory field in revision",
                                        field,
                                        partial_revision = ?partial_revision,
                                        revision_end_position = self.xml_parser.buffer_position()
                                    );
                                    if cfg!(feature = "strict") {
                                        return Err(ParsingError::MissingField(field));
                                    }
                                    tracing::warn!("Ignoring revision with missing mandatory field");
                                    page.skipped_revisions += 1;
                                }
                            }
                        }
                        Some(Tag::Page) => break,
                        _ => {}
                    }
                }
                Event::Eof => {
                    if started_page {
                        tracing::error!(
                            title = page.title.as_str(),
                            revisions = page.revisions.len(),
                            current_path = ?self.current_path
                        );
                        return Err(ParsingError::Eof);
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }

        tracing::debug!(
            title = page.title.as_str(),
            revisions = page.revisions.len(),
            "parsed page"
        );
        Ok(Some(page))
    }
}

/// Parse the first page of an in-memory export document.
pub fn parse_export(document: &str) -> Result<Option<Page>, ParsingError> {
    ExportParser::new(document.as_bytes()).parse_page()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{export_xml, ExportRevision};

    #[test]
    fn parses_revisions_in_document_order() {
        let xml = export_xml(
            "Venezuela",
            &[
                ExportRevision::new(2, "2004-08-05T02:30:31Z", "second [[link]]"),
                ExportRevision::new(1, "2004-08-04T10:00:00Z", "first"),
            ],
        );

        let mut parser = ExportParser::new(xml.as_bytes());
        let page = parser.parse_page().unwrap().unwrap();

        assert_eq!(parser.site_info().dbname, "enwiki");
        assert_eq!(page.title, "Venezuela");
        assert_eq!(page.namespace, 0);
        let ids: Vec<_> = page.revisions.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(page.revisions[0].timestamp, "2004-08-05T02:30:31Z");
        assert_eq!(page.revisions[0].text.as_str(), Some("second [[link]]"));
        assert_eq!(page.revisions[0].text_bytes, Some(15));
        assert_eq!(page.revisions[0].text_xml_space.as_deref(), Some("preserve"));
        assert_eq!(page.revisions[0].contributor.name(), Some("Editor2"));

        assert!(parser.parse_page().unwrap().is_none());
    }

    #[test]
    fn unescapes_markup_inside_text() {
        let xml = export_xml(
            "Venezuela",
            &[ExportRevision::new(
                7,
                "2010-01-01T00:00:00Z",
                "<ref>Inflation & \"crisis\"</ref>",
            )],
        );

        let page = parse_export(&xml).unwrap().unwrap();
        assert_eq!(
            page.revisions[0].text.as_str(),
            Some("<ref>Inflation & \"crisis\"</ref>")
        );
    }

    #[test]
    fn deleted_text_and_anonymous_contributor() {
        let xml = r#"<mediawiki version="0.11" xml:lang="en">
  <page>
    <title>Venezuela</title>
    <ns>0</ns>
    <id>32374</id>
    <revision>
      <id>10</id>
      <timestamp>2006-03-01T12:00:00Z</timestamp>
      <contributor><ip>192.0.2.1</ip></contributor>
      <minor />
      <text bytes="120" deleted="deleted" />
    </revision>
  </page>
</mediawiki>"#;

        let page = parse_export(xml).unwrap().unwrap();
        let revision = &page.revisions[0];
        assert_eq!(page.id, Some(32374));
        assert_eq!(revision.text, Text::Deleted);
        assert_eq!(revision.text_bytes, Some(120));
        assert!(revision.minor);
        assert_eq!(revision.contributor.name(), Some("192.0.2.1"));
        assert_eq!(revision.contributor.id, None);
    }

    #[cfg(not(feature = "strict"))]
    #[test]
    fn skips_revision_without_timestamp() {
        let xml = r#"<mediawiki>
  <page>
    <title>Venezuela</title>
    <revision><id>1</id><text>no timestamp</text></revision>
    <revision><id>2</id><timestamp>2006-03-01T12:00:00Z</timestamp><text>kept</text></revision>
  </page>
</mediawiki>"#;

        let page = parse_export(xml).unwrap().unwrap();
        assert_eq!(page.revisions.len(), 1);
        assert_eq!(page.revisions[0].id, 2);
        assert_eq!(page.skipped_revisions, 1);
    }

    const MISSPELLED_END_TAG: &str = "<mediawiki><page><title>X</title><revision><id>1</id>\
        <timestamp>2006-03-01T12:00:00Z</timestamp><comment>a</comentx><text>kept</text>\
        </revision></page></mediawiki>";

    #[test]
    #[cfg(not(feature = "strict"))]
    fn misspelled_end_tag_is_tolerated() {
        let page = parse_export(MISSPELLED_END_TAG).unwrap().unwrap();
        assert_eq!(page.revisions.len(), 1);
        assert_eq!(page.revisions[0].id, 1);
        assert_eq!(page.revisions[0].text, Text::Normal("kept".into()));
    }

    #[test]
    #[cfg(feature = "strict")]
    fn misspelled_end_tag_is_rejected() {
        let result = parse_export(MISSPELLED_END_TAG);
        assert!(matches!(
            result,
            Err(ParsingError::MismatchedTag { actual, .. }) if actual == "comentx"
        ));
    }

    #[test]
    fn document_without_page_is_empty() {
        let xml = r#"<mediawiki version="0.11"><siteinfo><dbname>eswiki</dbname></siteinfo></mediawiki>"#;

        let mut parser = ExportParser::new(xml.as_bytes());
        assert!(parser.parse_page().unwrap().is_none());
        assert_eq!(parser.site_info().dbname, "eswiki");
    }

    #[test]
    fn truncated_page_is_an_error() {
        let xml = r#"<mediawiki><page><title>Venezuela</title><revision><id>1</id>"#;

        assert!(parse_export(xml).is_err());
    }
}
