// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::ManifestError;
use crate::types::{ReleaseArtifact, ReleaseItem};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use semver::Version;
use time::format_description::well_known::Rfc2822;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextField {
    Version,
    PublishDate,
}

#[derive(Debug, Default)]
struct PartialItem {
    version: Option<String>,
    publish_date: Option<String>,
    artifacts: Vec<ReleaseArtifact>,
}

impl PartialItem {
    fn finish(self) -> Option<ReleaseItem> {
        let Some(raw_version) = self.version else {
            warn!("skipping release item without a version");
            return None;
        };
        let version = match Version::parse(raw_version.trim()) {
            Ok(version) => version,
            Err(err) => {
                warn!("skipping release item with invalid version '{raw_version}': {err}");
                return None;
            }
        };
        if self.artifacts.is_empty() {
            warn!("skipping release item {version} as it has no artifacts");
            return None;
        }

        Some(ReleaseItem {
            version,
            publish_date: self
                .publish_date
                .as_deref()
                .map(parse_publish_date)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            artifacts: self.artifacts,
        })
    }
}

/// Best-effort parse of an RFC 2822 date (e.g. `Wed, 12 Nov 2025 17:30:00 -0700`),
/// defaulting to the unix epoch.
pub fn parse_publish_date(raw: &str) -> OffsetDateTime {
    let raw = raw.trim();
    if let Ok(date) = OffsetDateTime::parse(raw, &Rfc2822) {
        return date;
    }

    // feeds are hand-edited often enough to end up with a day-of-week that doesn't match the date
    let without_weekday = raw.split_once(',').map(|(_, rest)| rest.trim()).unwrap_or(raw);
    let lenient = format_description!(
        "[day padding:none] [month repr:short] [year] [hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
    );
    match OffsetDateTime::parse(without_weekday, lenient) {
        Ok(date) => date,
        Err(err) => {
            debug!("could not parse publish date '{raw}': {err}");
            OffsetDateTime::UNIX_EPOCH
        }
    }
}

fn artifact_from_attributes(element: &BytesStart<'_>) -> Option<ReleaseArtifact> {
    let mut url = String::new();
    let mut artifact = ReleaseArtifact {
        url: String::new(),
        os: String::new(),
        arch: String::new(),
        signature: String::new(),
        length: 0,
    };

    for attribute in element.attributes() {
        let attribute = match attribute {
            Ok(attribute) => attribute,
            Err(err) => {
                warn!("malformed enclosure attribute: {err}");
                continue;
            }
        };
        let value = match attribute.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(err) => {
                warn!("could not unescape enclosure attribute: {err}");
                continue;
            }
        };

        // both the namespaced (`sparkle:os`) and bare (`os`) forms are accepted
        match attribute.key.local_name().as_ref() {
            b"url" => url = value,
            b"os" => artifact.os = value,
            b"arch" => artifact.arch = value,
            b"edSignature" => artifact.signature = value,
            b"length" => artifact.length = value.trim().parse().unwrap_or_default(),
            _ => (),
        }
    }

    if url.is_empty() {
        warn!("ignoring enclosure without a download url");
        return None;
    }
    artifact.url = url;
    Some(artifact)
}

/// Stream through the feed and collect every valid release item in document order.
///
/// Items without a (semver) version or without any artifact are dropped.
pub fn parse_items(raw: &str) -> Result<Vec<ReleaseItem>, ManifestError> {
    let mut reader = Reader::from_str(raw);
    reader.trim_text(true);

    let mut items = Vec::new();

    let mut depth = 0usize;
    let mut in_channel = false;
    let mut item_depth: Option<usize> = None;
    let mut current = PartialItem::default();
    let mut capture: Option<(TextField, String)> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|source| ManifestError::MalformedXml {
                position: reader.buffer_position(),
                source,
            })?;

        match event {
            Event::Start(element) => {
                depth += 1;
                let name = element.local_name();
                match name.as_ref() {
                    b"channel" => in_channel = true,
                    b"item" if in_channel && item_depth.is_none() => {
                        item_depth = Some(depth);
                        current = PartialItem::default();
                    }
                    b"version" if item_depth.is_some() => {
                        capture = Some((TextField::Version, String::new()))
                    }
                    b"pubDate" if item_depth.is_some() => {
                        capture = Some((TextField::PublishDate, String::new()))
                    }
                    b"enclosure" if item_depth.is_some() => {
                        current.artifacts.extend(artifact_from_attributes(&element))
                    }
                    _ => (),
                }
            }
            Event::Empty(element) => {
                if item_depth.is_some() && element.local_name().as_ref() == b"enclosure" {
                    current.artifacts.extend(artifact_from_attributes(&element))
                }
            }
            Event::Text(text) => {
                if let Some((_, buf)) = capture.as_mut() {
                    match text.unescape() {
                        Ok(content) => buf.push_str(&content),
                        Err(err) => warn!("could not unescape element content: {err}"),
                    }
                }
            }
            Event::CData(data) => {
                if let Some((_, buf)) = capture.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&data.into_inner()))
                }
            }
            Event::End(element) => {
                let name = element.local_name();
                match name.as_ref() {
                    b"channel" => in_channel = false,
                    b"item" if item_depth == Some(depth) => {
                        item_depth = None;
                        items.extend(std::mem::take(&mut current).finish());
                    }
                    b"version" | b"pubDate" => {
                        if let Some((field, content)) = capture.take() {
                            match field {
                                TextField::Version => current.version = Some(content),
                                TextField::PublishDate => current.publish_date = Some(content),
                            }
                        }
                    }
                    _ => (),
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => (),
        }
    }

    trace!("parsed {} release items", items.len());
    Ok(items)
}

/// Convenience wrapper returning only the first valid item of the feed.
pub fn parse_latest_item(raw: &str) -> Result<Option<ReleaseItem>, ManifestError> {
    Ok(parse_items(raw)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use crate::types::ReleaseManifest;
    use time::macros::datetime;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0" xmlns:sparkle="http://www.andymatuschak.org/xml-namespaces/sparkle">
  <channel>
    <title>backend releases</title>
    <item>
      <title>2.0.0</title>
      <sparkle:version>2.0.0</sparkle:version>
      <pubDate>Wed, 12 Nov 2025 17:30:00 -0700</pubDate>
      <enclosure
        url="https://cdn.example.com/backend-2.0.0-darwin-arm64.tar.gz"
        sparkle:os="macos"
        sparkle:arch="arm64"
        sparkle:edSignature="bWFjb3Mtc2lnbmF0dXJl"
        length="1234"
        type="application/gzip"/>
      <enclosure
        url="https://cdn.example.com/backend-2.0.0-linux-x86_64.tar.gz"
        sparkle:os="linux"
        sparkle:arch="x86_64"
        sparkle:edSignature="bGludXgtc2lnbmF0dXJl"
        length="5678"
        type="application/gzip"/>
    </item>
    <item>
      <sparkle:version>1.9.0</sparkle:version>
      <pubDate>Wed, 01 Oct 2025 09:00:00 +0000</pubDate>
      <enclosure url="https://cdn.example.com/backend-1.9.0-linux-x86_64.tar.gz"
        sparkle:os="linux" sparkle:arch="x86_64" sparkle:edSignature="b2xk" length="99"/>
    </item>
  </channel>
</rss>
"#;

    #[test]
    fn parses_all_items_in_document_order() {
        let items = parse_items(FEED).unwrap();
        assert_eq!(items.len(), 2);

        let newest = &items[0];
        assert_eq!(newest.version, Version::new(2, 0, 0));
        assert_eq!(newest.publish_date, datetime!(2025-11-12 17:30:00 -7));
        assert_eq!(newest.artifacts.len(), 2);

        let linux = newest
            .artifact_for(&Platform::new("linux", "x86_64"))
            .unwrap();
        assert_eq!(
            linux.url,
            "https://cdn.example.com/backend-2.0.0-linux-x86_64.tar.gz"
        );
        assert_eq!(linux.signature, "bGludXgtc2lnbmF0dXJl");
        assert_eq!(linux.length, 5678);

        assert_eq!(items[1].version, Version::new(1, 9, 0));
    }

    #[test]
    fn latest_item_is_first_retained() {
        let latest = parse_latest_item(FEED).unwrap().unwrap();
        assert_eq!(latest.version, Version::new(2, 0, 0));
    }

    #[test]
    fn drops_invalid_items() {
        let feed = r#"<rss><channel>
            <item>
              <pubDate>Wed, 12 Nov 2025 17:30:00 -0700</pubDate>
              <enclosure url="https://a" sparkle:os="linux" sparkle:arch="x86_64" length="1"/>
            </item>
            <item>
              <sparkle:version>not-a-version</sparkle:version>
              <enclosure url="https://b" sparkle:os="linux" sparkle:arch="x86_64" length="1"/>
            </item>
            <item>
              <sparkle:version>3.0.0</sparkle:version>
            </item>
            <item>
              <sparkle:version>3.1.0</sparkle:version>
              <enclosure sparkle:os="linux" sparkle:arch="x86_64" length="1"/>
            </item>
            <item>
              <version>1.2.3</version>
              <enclosure url="https://c" os="linux" arch="arm64" length="7"/>
            </item>
        </channel></rss>"#;

        let items = parse_items(feed).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].version, Version::new(1, 2, 3));
        assert_eq!(items[0].artifacts[0].arch, "arm64");
        assert_eq!(items[0].artifacts[0].length, 7);
        // no pubDate at all
        assert_eq!(items[0].publish_date, OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn feed_without_valid_items_is_empty_not_an_error() {
        let feed = r#"<rss><channel><item><sparkle:version>x</sparkle:version></item></channel></rss>"#;
        let manifest = ReleaseManifest::parse(feed).unwrap();
        assert!(manifest.is_empty());

        let manifest = ReleaseManifest::parse("<rss><channel></channel></rss>").unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn items_outside_channel_are_ignored() {
        let feed = r#"<rss>
            <item>
              <sparkle:version>9.9.9</sparkle:version>
              <enclosure url="https://a" sparkle:os="linux" sparkle:arch="x86_64" length="1"/>
            </item>
        </rss>"#;
        assert!(parse_items(feed).unwrap().is_empty());
    }

    #[test]
    fn unparseable_date_defaults_to_epoch() {
        let feed = r#"<rss><channel><item>
              <sparkle:version>1.0.0</sparkle:version>
              <pubDate>sometime last week</pubDate>
              <enclosure url="https://a" sparkle:os="linux" sparkle:arch="x86_64" length="1"/>
        </item></channel></rss>"#;
        let items = parse_items(feed).unwrap();
        assert_eq!(items[0].publish_date, OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn malformed_document_is_an_error() {
        let feed = "<rss><channel><item></channel></rss>";
        assert!(matches!(
            parse_items(feed),
            Err(ManifestError::MalformedXml { .. })
        ));
    }

    #[test]
    fn non_utf8_bytes_are_rejected() {
        assert!(matches!(
            ReleaseManifest::parse_bytes(&[0xff, 0xfe, 0x00]),
            Err(ManifestError::InvalidEncoding)
        ));
    }
}
