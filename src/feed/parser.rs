use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use super::FeedItem;

/// Errors that make a feed payload unusable.
///
/// Any of these fails the whole payload of one source; items are never
/// partially recovered from a document that is not well-formed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Syntax error reported by the XML reader (mismatched tags, bad entities, ...)
    #[error("XML parse error at byte {position}: {message}")]
    Xml { position: u64, message: String },
    /// Payload contained no element at all
    #[error("Document has no root element")]
    NoRootElement,
    /// A second top-level element followed the root
    #[error("Document has more than one root element")]
    MultipleRoots,
    /// Non-whitespace text outside the root element
    #[error("Text outside the root element")]
    TextOutsideRoot,
    /// Document ended with elements still open
    #[error("Document ended inside an open element")]
    UnexpectedEof,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Title,
    Link,
    Guid,
    PubDate,
    Description,
}

impl Field {
    fn from_tag(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Self::Title),
            b"link" => Some(Self::Link),
            b"guid" => Some(Self::Guid),
            b"pubDate" => Some(Self::PubDate),
            b"description" => Some(Self::Description),
            _ => None,
        }
    }
}

/// Text of a field and whether it came from a direct child of the item.
struct FieldValue {
    text: String,
    direct: bool,
}

/// Fields found so far for the item being read. `None` means not seen yet.
#[derive(Default)]
struct ItemBuilder {
    depth: usize,
    title: Option<FieldValue>,
    link: Option<FieldValue>,
    guid: Option<FieldValue>,
    pub_date: Option<FieldValue>,
    description: Option<FieldValue>,
}

impl ItemBuilder {
    fn at_depth(depth: usize) -> Self {
        Self {
            depth,
            ..Default::default()
        }
    }

    fn slot(&mut self, field: Field) -> &mut Option<FieldValue> {
        match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Guid => &mut self.guid,
            Field::PubDate => &mut self.pub_date,
            Field::Description => &mut self.description,
        }
    }

    /// A direct child replaces a value taken from deeper down; otherwise the first one stays.
    fn wants(&mut self, field: Field, direct: bool) -> bool {
        match self.slot(field) {
            None => true,
            Some(value) => direct && !value.direct,
        }
    }

    fn build(self) -> FeedItem {
        let text = |value: Option<FieldValue>| value.map(|v| v.text).unwrap_or_default();
        FeedItem {
            title: text(self.title),
            link: text(self.link),
            guid: text(self.guid),
            published_at: text(self.pub_date),
            description: text(self.description),
        }
    }
}

struct Capture {
    field: Field,
    depth: usize,
    direct: bool,
    /// Set once a child element opens; later text belongs to that child's tail.
    closed: bool,
    text: String,
}

/// Extracts every `<item>` of a feed document, in document order.
///
/// Items are found at any depth, so RSS 2.0 (`rss/channel/item`), RSS 1.0
/// (`rdf:RDF/item`) and odd nestings all work. Within an item, the first
/// `title`, `link`, `guid`, `pubDate` and `description` child supplies that
/// field. When no direct child exists, the first matching element deeper in
/// the item is used instead; missing elements leave the field empty.
///
/// A field's value is the text (and CDATA) before the element's first
/// child, with entities unescaped and surrounding whitespace trimmed.
///
/// Tag names are compared exactly, prefix included: `<atom:link>` is not a
/// `link`.
///
/// # Errors
///
/// Returns a [`ParseError`] if the payload is not a well-formed XML document,
/// including an unknown entity reference anywhere in the document.
///
/// # Security
///
/// `quick-xml` (0.37) does not parse `<!ENTITY>` declarations, so custom
/// entities fail to unescape instead of being expanded.
pub fn parse_items(xml: &str) -> Result<Vec<FeedItem>, ParseError> {
    let mut reader = Reader::from_str(xml);

    let mut items = Vec::new();
    let mut depth: usize = 0;
    let mut seen_root = false;
    let mut item: Option<ItemBuilder> = None;
    let mut capture: Option<Capture> = None;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                return Err(ParseError::Xml {
                    position: reader.error_position() as u64,
                    message: e.to_string(),
                })
            }
        };

        match event {
            Event::Start(e) => {
                if depth == 0 {
                    if seen_root {
                        return Err(ParseError::MultipleRoots);
                    }
                    seen_root = true;
                }
                if let Some(c) = capture.as_mut() {
                    c.closed = true;
                }
                depth += 1;

                let name = e.name();
                match item.as_mut() {
                    None if name.as_ref() == b"item" => {
                        item = Some(ItemBuilder::at_depth(depth));
                    }
                    Some(builder) if capture.is_none() => {
                        let direct = depth == builder.depth + 1;
                        if let Some(field) = Field::from_tag(name.as_ref()) {
                            if builder.wants(field, direct) {
                                capture = Some(Capture {
                                    field,
                                    depth,
                                    direct,
                                    closed: false,
                                    text: String::new(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                if depth == 0 {
                    if seen_root {
                        return Err(ParseError::MultipleRoots);
                    }
                    seen_root = true;
                }
                if let Some(c) = capture.as_mut() {
                    c.closed = true;
                }

                let name = e.name();
                match item.as_mut() {
                    None if name.as_ref() == b"item" => items.push(FeedItem::default()),
                    Some(builder) if capture.is_none() => {
                        let direct = depth == builder.depth;
                        if let Some(field) = Field::from_tag(name.as_ref()) {
                            if builder.wants(field, direct) {
                                *builder.slot(field) = Some(FieldValue {
                                    text: String::new(),
                                    direct,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                if capture.as_ref().is_some_and(|c| c.depth == depth) {
                    if let (Some(done), Some(builder)) = (capture.take(), item.as_mut()) {
                        *builder.slot(done.field) = Some(FieldValue {
                            text: done.text.trim().to_string(),
                            direct: done.direct,
                        });
                    }
                }
                if item.as_ref().is_some_and(|b| b.depth == depth) {
                    if let Some(builder) = item.take() {
                        items.push(builder.build());
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(e) => {
                if depth == 0 {
                    if !is_blank(&String::from_utf8_lossy(&e)) {
                        return Err(ParseError::TextOutsideRoot);
                    }
                    continue;
                }
                // Unknown entities fail the document wherever they appear
                let text = e.unescape().map_err(|err| ParseError::Xml {
                    position: reader.buffer_position() as u64,
                    message: err.to_string(),
                })?;
                if let Some(c) = capture.as_mut().filter(|c| c.depth == depth && !c.closed) {
                    c.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                if depth == 0 {
                    return Err(ParseError::TextOutsideRoot);
                }
                if let Some(c) = capture.as_mut().filter(|c| c.depth == depth && !c.closed) {
                    c.text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth > 0 {
        return Err(ParseError::UnexpectedEof);
    }
    if !seen_root {
        return Err(ParseError::NoRootElement);
    }

    Ok(items)
}

fn is_blank(text: &str) -> bool {
    text.chars().all(|c| c.is_whitespace() || c == '\u{feff}')
}
