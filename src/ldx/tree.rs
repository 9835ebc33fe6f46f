//! Owned XML tree for LDX documents
//!
//! Elements own their children; there are no parent links. Sections are
//! reached by walking path segments from the root, creating them on demand.

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Overwrite `key` in place, or append it after the existing attributes
    pub fn set_attr(&mut self, key: &str, value: &str) {
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attributes.push((key.to_string(), value.to_string())),
        }
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    /// First child element called `name`
    pub fn section(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.name == name)
    }

    /// First child element called `name`, appended if absent
    pub fn section_mut(&mut self, name: &str) -> &mut Element {
        self.section_or_insert_with(name, || Element::new(name))
    }

    /// Like [`Element::section_mut`] but builds the missing element with `make`
    pub fn section_or_insert_with(
        &mut self,
        name: &str,
        make: impl FnOnce() -> Element,
    ) -> &mut Element {
        let idx = match self
            .children
            .iter()
            .position(|node| matches!(node, Node::Element(el) if el.name == name))
        {
            Some(idx) => idx,
            None => {
                self.children.push(Node::Element(make()));
                self.children.len() - 1
            }
        };

        match &mut self.children[idx] {
            Node::Element(el) => el,
            _ => unreachable!("index points at an element"),
        }
    }

    /// Follow a path of section names without creating anything
    pub fn path(&self, segments: &[&str]) -> Option<&Element> {
        segments
            .iter()
            .try_fold(self, |el, segment| el.section(segment))
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }
}

/// A parsed LDX document: just its root element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub root: Element,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("xml error at byte {position}: {message}")]
    Xml { position: usize, message: String },
    #[error("document has no root element")]
    NoRoot,
    #[error("document has more than one root element")]
    MultipleRoots,
    #[error("unexpected closing tag </{0}>")]
    UnexpectedEnd(String),
    #[error("unclosed element <{0}>")]
    Unclosed(String),
    #[error("text outside the root element")]
    StrayText,
}

impl Document {
    pub fn parse(xml: &str) -> Result<Self, ParseError> {
        let mut reader = Reader::from_str(xml);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let position = reader.buffer_position();
            let event = reader.read_event().map_err(|e| ParseError::Xml {
                position,
                message: e.to_string(),
            })?;

            match event {
                Event::Start(ref start) => {
                    let el = element_from_start(start, position)?;
                    if root.is_some() && stack.is_empty() {
                        return Err(ParseError::MultipleRoots);
                    }
                    stack.push(el);
                }
                Event::Empty(ref start) => {
                    let el = element_from_start(start, position)?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::End(ref end) => {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    let el = match stack.pop() {
                        Some(el) if el.name == name => el,
                        _ => return Err(ParseError::UnexpectedEnd(name)),
                    };
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Text(ref text) => {
                    let text = text.unescape().map_err(|e| ParseError::Xml {
                        position,
                        message: e.to_string(),
                    })?;
                    // indentation between elements is not content
                    if text.trim().is_empty() {
                        continue;
                    }
                    push_node(&mut stack, Node::Text(text.into_owned()))?;
                }
                Event::CData(cdata) => {
                    let text = String::from_utf8_lossy(&cdata.into_inner()).into_owned();
                    push_node(&mut stack, Node::CData(text))?;
                }
                Event::Comment(comment) => {
                    let text = String::from_utf8_lossy(&comment.into_inner()).into_owned();
                    // comments around the root are dropped with the prolog
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Comment(text));
                    }
                }
                Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if let Some(open) = stack.pop() {
            return Err(ParseError::Unclosed(open.name));
        }

        root.map(|root| Document { root }).ok_or(ParseError::NoRoot)
    }

    /// Full serialization: declaration, two-space indentation, trailing newline
    pub fn to_xml(&self) -> Result<String, quick_xml::Error> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        write_element(&mut writer, &self.root)?;

        let mut out = String::from_utf8(writer.into_inner())
            .map_err(|e| quick_xml::Error::NonDecodable(Some(e.utf8_error())))?;
        out.push('\n');
        Ok(out)
    }
}

fn element_from_start(start: &BytesStart<'_>, position: usize) -> Result<Element, ParseError> {
    let mut el = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ParseError::Xml {
            position,
            message: e.to_string(),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| ParseError::Xml {
            position,
            message: e.to_string(),
        })?;
        el.attributes.push((key, value.into_owned()));
    }
    Ok(el)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(el));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(el);
            Ok(())
        }
        None => Err(ParseError::MultipleRoots),
    }
}

fn push_node(stack: &mut [Element], node: Node) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None => Err(ParseError::StrayText),
    }
}

fn write_element(writer: &mut Writer<Vec<u8>>, el: &Element) -> Result<(), quick_xml::Error> {
    let mut start = BytesStart::new(el.name.as_str());
    for (key, value) in &el.attributes {
        start.push_attribute(Attribute {
            key: QName(key.as_bytes()),
            value: Cow::Owned(escape_attribute(value).into_bytes()),
        });
    }

    if el.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in &el.children {
        match child {
            Node::Element(child) => write_element(writer, child)?,
            Node::Text(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
            Node::CData(text) => writer.write_event(Event::CData(BytesCData::new(text.as_str())))?,
            Node::Comment(text) => {
                writer.write_event(Event::Comment(BytesText::from_escaped(Cow::Borrowed(
                    text.as_str(),
                ))))?
            }
        }
    }
    writer.write_event(Event::End(BytesEnd::new(el.name.as_str())))?;
    Ok(())
}

/// Escape an attribute value, keeping whitespace characters that attribute
/// normalization would otherwise turn into spaces
fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<LDXFile Locale="English_Australia.1252" DefaultLocale="C" Version="1.6">
 <Layers>
  <Layer>
   <MarkerBlock>
    <MarkerGroup Name="Session" Index="3"/>
   </MarkerBlock>
  </Layer>
  <Details>
   <String Id="Total Laps" Value="12"/>
   <!-- written by i2 -->
   <String Id="Fastest Time" Value="1:23.456"/>
  </Details>
 </Layers>
</LDXFile>"#;

    #[test]
    fn parses_sections_by_path() {
        let doc = Document::parse(SAMPLE).unwrap();
        assert_eq!(doc.root.name, "LDXFile");
        let details = doc.root.path(&["Layers", "Details"]).unwrap();
        let ids: Vec<_> = details.elements().filter_map(|e| e.attr("Id")).collect();
        assert_eq!(ids, vec!["Total Laps", "Fastest Time"]);
        assert!(doc.root.path(&["Maths", "MathConstants"]).is_none());
    }

    #[test]
    fn serializes_with_two_space_indent() {
        let mut doc = Document::parse("<Root><A x=\"1\"/></Root>").unwrap();
        doc.root
            .section_mut("Layers")
            .section_mut("Details")
            .push(Element::new("String").with_attr("Id", "Torque").with_attr("Value", "42"));

        let xml = doc.to_xml().unwrap();
        let expected = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
<Root>\n  <A x=\"1\"/>\n  <Layers>\n    <Details>\n      <String Id=\"Torque\" Value=\"42\"/>\n    </Details>\n  </Layers>\n</Root>\n";
        assert_eq!(xml, expected);
    }

    #[test]
    fn reserialization_is_stable() {
        let once = Document::parse(SAMPLE).unwrap().to_xml().unwrap();
        let twice = Document::parse(&once).unwrap().to_xml().unwrap();
        assert_eq!(once, twice);
        assert!(once.contains("<!-- written by i2 -->"));
    }

    #[test]
    fn attribute_values_round_trip_escaping() {
        let mut root = Element::new("Root");
        root.push(Element::new("String").with_attr("Id", "Notes").with_attr("Value", "a < b & \"c\""));
        let xml = Document { root }.to_xml().unwrap();
        let back = Document::parse(&xml).unwrap();
        let el = back.root.elements().next().unwrap();
        assert_eq!(el.attr("Value"), Some("a < b & \"c\""));
    }

    #[test]
    fn multi_line_attribute_values_survive() {
        let notes = "line one\nline two\ttab\r\nend";
        let mut root = Element::new("Root");
        root.push(Element::new("String").with_attr("Id", "Chief.notes").with_attr("Value", notes));

        let xml = Document { root }.to_xml().unwrap();
        assert!(xml.contains(r#"Value="line one&#10;line two&#9;tab&#13;&#10;end""#));
        assert!(!xml.contains("line one\n"));

        let back = Document::parse(&xml).unwrap();
        assert_eq!(back.root.elements().next().unwrap().attr("Value"), Some(notes));
    }

    #[test]
    fn text_keeps_surrounding_whitespace() {
        let doc = Document::parse("<Root>\n  <Note>  padded  </Note>\n</Root>").unwrap();
        let note = doc.root.section("Note").unwrap();
        assert_eq!(note.children, vec![Node::Text("  padded  ".to_string())]);
        assert_eq!(doc.root.children.len(), 1);
    }

    #[test]
    fn section_mut_reuses_existing() {
        let mut root = Element::new("Root");
        root.section_mut("Maths");
        root.section_mut("Maths").set_attr("Id", "Local");
        assert_eq!(root.elements().count(), 1);
        assert_eq!(root.section("Maths").unwrap().attr("Id"), Some("Local"));
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(Document::parse(""), Err(ParseError::NoRoot)));
        assert!(Document::parse("<Root><A></Root>").is_err());
        assert!(matches!(Document::parse("<Root>"), Err(ParseError::Unclosed(_))));
        assert!(matches!(Document::parse("<A/><B/>"), Err(ParseError::MultipleRoots)));
        assert!(Document::parse("<Root attr=novalue/>").is_err());
        assert!(Document::parse("just some text").is_err());
    }
}
