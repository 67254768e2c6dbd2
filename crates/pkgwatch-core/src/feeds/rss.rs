//! Minimal RSS 2.0 item reader

use crate::error::{FeedError, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

/// The parts of an `<item>` the pollers care about
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RssItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub pub_date: Option<String>,
}

impl RssItem {
    /// `pubDate` as UTC, if present and in RFC 2822 form
    pub fn published(&self) -> Option<DateTime<Utc>> {
        let raw = self.pub_date.as_deref()?;
        DateTime::parse_from_rfc2822(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[derive(Clone, Copy)]
enum Field {
    Title,
    Link,
    PubDate,
}

/// Read every `<item>` in an RSS document
pub(crate) fn parse_items(feed: &str, xml: &str) -> Result<Vec<RssItem>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<RssItem> = None;
    let mut field: Option<Field> = None;

    let xml_error = |e: quick_xml::Error| FeedError::Xml {
        feed: feed.to_string(),
        message: e.to_string(),
    };

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"item" => current = Some(RssItem::default()),
                b"title" => field = Some(Field::Title),
                b"link" => field = Some(Field::Link),
                b"pubDate" => field = Some(Field::PubDate),
                _ => field = None,
            },
            Event::Text(t) => {
                if let (Some(item), Some(f)) = (current.as_mut(), field) {
                    let text = t.unescape().map_err(xml_error)?.into_owned();
                    set_field(item, f, text);
                }
            }
            Event::CData(c) => {
                if let (Some(item), Some(f)) = (current.as_mut(), field) {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    set_field(item, f, text);
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"item" {
                    if let Some(item) = current.take() {
                        items.push(item);
                    }
                }
                field = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(items)
}

fn set_field(item: &mut RssItem, field: Field, text: String) {
    let slot = match field {
        Field::Title => &mut item.title,
        Field::Link => &mut item.link,
        Field::PubDate => &mut item.pub_date,
    };
    match slot {
        Some(existing) => existing.push_str(&text),
        None => *slot = Some(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>PyPI recent updates</title>
    <link>https://pypi.org/</link>
    <item>
      <title>requests 2.31.0</title>
      <link>https://pypi.org/project/requests/2.31.0/</link>
      <pubDate>Fri, 01 Mar 2024 11:58:00 GMT</pubDate>
    </item>
    <item>
      <title><![CDATA[a&b 0.1]]></title>
      <pubDate>not a date</pubDate>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_items_only() {
        let items = parse_items("pypi", FEED).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title.as_deref(), Some("requests 2.31.0"));
        assert_eq!(
            items[0].link.as_deref(),
            Some("https://pypi.org/project/requests/2.31.0/")
        );
        assert_eq!(items[1].title.as_deref(), Some("a&b 0.1"));
    }

    #[test]
    fn test_pub_date_parsing() {
        let items = parse_items("pypi", FEED).unwrap();
        let published = items[0].published().unwrap();
        assert_eq!(published.to_rfc3339(), "2024-03-01T11:58:00+00:00");
        assert!(items[1].published().is_none());
    }

    #[test]
    fn test_escaped_text() {
        let xml = "<rss><channel><item><title>a &amp; b</title></item></channel></rss>";
        let items = parse_items("npm", xml).unwrap();
        assert_eq!(items[0].title.as_deref(), Some("a & b"));
    }

    #[test]
    fn test_broken_xml() {
        let err = parse_items("npm", "<rss><channel><item><title>x</channel></rss>");
        assert!(err.is_err());
    }
}
