use std::collections::VecDeque;

use chrono::NaiveDateTime;
use compact_str::format_compact;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use crate::{
    paginator::{ExportRequest, RevisionSource, SourceError},
    pipeline::{
        Buckets, FeatureRow, RecordTimestamp, RevisionRecord, TermFeatures,
        SAVED_TIMESTAMP_FORMAT,
    },
};

#[derive(Debug, Clone, Copy)]
pub struct ExportRevision {
    pub id: i64,
    pub timestamp: &'static str,
    pub text: &'static str,
}

impl ExportRevision {
    pub fn new(id: i64, timestamp: &'static str, text: &'static str) -> Self {
        Self {
            id,
            timestamp,
            text,
        }
    }
}

fn write_text_element<W: std::io::Write>(writer: &mut quick_xml::Writer<W>, name: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .unwrap();
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .unwrap();
    writer.write_event(Event::End(BytesEnd::new(name))).unwrap();
}

/// Render a `Special:Export` document holding one page with `revisions`.
pub fn export_xml(title: &str, revisions: &[ExportRevision]) -> String {
    let mut writer = quick_xml::Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Start(BytesStart::new("mediawiki").with_attributes([
            ("xmlns", "http://www.mediawiki.org/xml/export-0.11/"),
            ("version", "0.11"),
            ("xml:lang", "en"),
        ])))
        .unwrap();

    writer
        .write_event(Event::Start(BytesStart::new("siteinfo")))
        .unwrap();
    write_text_element(&mut writer, "sitename", "Wikipedia");
    write_text_element(&mut writer, "dbname", "enwiki");
    writer
        .write_event(Event::End(BytesEnd::new("siteinfo")))
        .unwrap();

    writer
        .write_event(Event::Start(BytesStart::new("page")))
        .unwrap();
    write_text_element(&mut writer, "title", title);
    write_text_element(&mut writer, "ns", "0");
    write_text_element(&mut writer, "id", "32374");

    for revision in revisions {
        writer
            .write_event(Event::Start(BytesStart::new("revision")))
            .unwrap();
        write_text_element(&mut writer, "id", &revision.id.to_string());
        write_text_element(&mut writer, "timestamp", revision.timestamp);

        writer
            .write_event(Event::Start(BytesStart::new("contributor")))
            .unwrap();
        write_text_element(&mut writer, "username", &format_compact!("Editor{}", revision.id));
        write_text_element(&mut writer, "id", &(1000 + revision.id).to_string());
        writer
            .write_event(Event::End(BytesEnd::new("contributor")))
            .unwrap();

        let bytes = revision.text.len().to_string();
        writer
            .write_event(Event::Start(BytesStart::new("text").with_attributes([
                ("bytes", bytes.as_str()),
                ("xml:space", "preserve"),
            ])))
            .unwrap();
        writer
            .write_event(Event::Text(BytesText::new(revision.text)))
            .unwrap();
        writer
            .write_event(Event::End(BytesEnd::new("text")))
            .unwrap();

        writer
            .write_event(Event::End(BytesEnd::new("revision")))
            .unwrap();
    }

    writer
        .write_event(Event::End(BytesEnd::new("page")))
        .unwrap();
    writer
        .write_event(Event::End(BytesEnd::new("mediawiki")))
        .unwrap();

    String::from_utf8(writer.into_inner()).unwrap()
}

/// Replays canned responses and remembers what was asked for.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    responses: VecDeque<Result<String, SourceError>>,
    pub offsets: Vec<String>,
    pub limits: Vec<usize>,
}

impl ScriptedSource {
    pub fn new(responses: impl IntoIterator<Item = Result<String, SourceError>>) -> Self {
        Self {
            responses: responses.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl RevisionSource for ScriptedSource {
    fn fetch_export(&mut self, request: &ExportRequest<'_>) -> Result<String, SourceError> {
        self.offsets.push(request.offset.clone());
        self.limits.push(request.limit);
        self.responses
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::Other("script ran out of responses".to_string())))
    }
}

/// A freshly harvested record, timestamp in export format.
pub fn record(id: i64, timestamp: &str, text: Option<&str>) -> RevisionRecord {
    RevisionRecord {
        id,
        timestamp: RecordTimestamp::Raw(timestamp.to_string()),
        contributor: Some(format_compact!("Editor{id}")),
        text: text.map(str::to_string),
        text_bytes: text.map(|text| text.len() as u64),
        text_xml: Some("preserve".into()),
        buckets: None,
    }
}

/// A feature row with zeroed features, `timestamp` as `%Y-%m-%d %H:%M:%S`.
pub fn feature_row(id: i64, timestamp: &str, text_clean: &str) -> FeatureRow {
    let timestamp = NaiveDateTime::parse_from_str(timestamp, SAVED_TIMESTAMP_FORMAT).unwrap();

    FeatureRow {
        id,
        timestamp,
        contributor: None,
        text: text_clean.to_string(),
        text_clean: Some(text_clean.to_string()),
        crisis: TermFeatures::default(),
        inflation: TermFeatures::default(),
        links: 0,
        buckets: Buckets::from_timestamp(&timestamp),
        is_vandalized: false,
    }
}
