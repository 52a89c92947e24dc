//! Minimal element tree over the quick-xml event reader.
//!
//! Names are stored without namespace prefix and namespace declarations are
//! dropped, so vendor metadata is matched by local name only. Text is
//! concatenated per element and kept as written; [`Element::child_text`]
//! trims it, [`Element::child_text_verbatim`] does not.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::DescriptorError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given local name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text content.
    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }

    /// Trimmed text of the first child with the given local name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Element::trimmed_text)
    }

    /// Untrimmed text of the first child with the given local name.
    pub fn child_text_verbatim(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Attribute of the first child with the given local name.
    pub fn child_attr(&self, child: &str, attr: &str) -> Option<&str> {
        self.child(child).and_then(|c| c.attr(attr))
    }
}

/// Parse a complete document into its root element.
pub fn parse(xml: &str) -> Result<Element, DescriptorError> {
    let mut reader = Reader::from_str(xml);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event().map_err(|e| DescriptorError::Malformed {
            position: reader.buffer_position(),
            message: e.to_string(),
        })?;
        let position = reader.buffer_position();

        match event {
            Event::Start(start) => stack.push(open(&start, position)?),
            Event::Empty(start) => {
                let element = open(&start, position)?;
                close(&mut stack, &mut root, element, position)?;
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| DescriptorError::Malformed {
                    position,
                    message: "closing tag without opening tag".to_string(),
                })?;
                close(&mut stack, &mut root, element, position)?;
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let text = text.unescape().map_err(|e| DescriptorError::Malformed {
                        position,
                        message: e.to_string(),
                    })?;
                    current.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions, doctype
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(DescriptorError::UnclosedElement(open.name));
    }
    root.ok_or(DescriptorError::Empty)
}

fn open(start: &BytesStart<'_>, position: usize) -> Result<Element, DescriptorError> {
    let malformed = |message: String| DescriptorError::Malformed { position, message };

    let name = std::str::from_utf8(start.local_name().as_ref())
        .map_err(|e| malformed(e.to_string()))?
        .to_string();

    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(e.to_string()))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        let key = std::str::from_utf8(attr.key.local_name().as_ref())
            .map_err(|e| malformed(e.to_string()))?
            .to_string();
        let value = attr.unescape_value().map_err(|e| malformed(e.to_string()))?;
        attributes.push((key, value.into_owned()));
    }

    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn close(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
    position: usize,
) -> Result<(), DescriptorError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(DescriptorError::Malformed {
            position,
            message: format!("second root element <{}>", element.name),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_elements() {
        let root = parse(
            r#"<?xml version="1.0"?>
            <!-- comment -->
            <domain type="kvm">
              <name> vm1 </name>
              <devices><disk device="cdrom"/><disk device="disk"/></devices>
            </domain>"#,
        )
        .unwrap();

        assert_eq!(root.name, "domain");
        assert_eq!(root.attr("type"), Some("kvm"));
        assert_eq!(root.child_text("name"), Some("vm1"));
        assert_eq!(root.child_text_verbatim("name"), Some(" vm1 "));
        let devices = root.child("devices").unwrap();
        let kinds: Vec<_> = devices.children_named("disk").filter_map(|d| d.attr("device")).collect();
        assert_eq!(kinds, ["cdrom", "disk"]);
    }

    #[test]
    fn test_namespaces_are_stripped() {
        let root = parse(
            r#"<domain xmlns:x="urn:x"><metadata><x:hosts x:kind="a">t</x:hosts></metadata></domain>"#,
        )
        .unwrap();
        assert!(root.attributes.is_empty());
        let hosts = root.child("metadata").unwrap().child("hosts").unwrap();
        assert_eq!(hosts.attr("kind"), Some("a"));
    }

    #[test]
    fn test_entities_and_cdata() {
        let root = parse(r#"<a b="x &amp; y"><c>1 &lt; 2</c><d><![CDATA[<raw>]]></d></a>"#).unwrap();
        assert_eq!(root.attr("b"), Some("x & y"));
        assert_eq!(root.child_text("c"), Some("1 < 2"));
        assert_eq!(root.child_text("d"), Some("<raw>"));
    }

    #[test]
    fn test_malformed_documents() {
        assert_eq!(parse(""), Err(DescriptorError::Empty));
        assert_eq!(parse("<a><b></b>"), Err(DescriptorError::UnclosedElement("a".to_string())));
        assert!(matches!(parse("<a></b>"), Err(DescriptorError::Malformed { .. })));
        assert!(matches!(parse("<a/><b/>"), Err(DescriptorError::Malformed { .. })));
    }
}
