use std::fs;
use std::path::Path;

use xmlwriter::{Indent, Options, XmlWriter};

use crate::error::{ErrorKind, Result, ScanariumError};

pub const SVG_NS: &str = "http://www.w3.org/2000/svg";
pub const INKSCAPE_NS: &str = "http://www.inkscape.org/namespaces/inkscape";
pub const XLINK_NS: &str = "http://www.w3.org/1999/xlink";

/// Qualified XML name. The prefix is kept verbatim so the document
/// serializes the way it was authored.
#[derive(Clone, Debug, PartialEq)]
pub struct QName {
    pub prefix: Option<String>,
    pub local: String,
    pub namespace: Option<String>,
}

impl QName {
    pub fn local(local: &str) -> Self {
        QName {
            prefix: None,
            local: local.to_string(),
            namespace: None,
        }
    }

    fn qualified(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.local),
            None => self.local.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

#[derive(Clone, Debug)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// A mutable element. Unknown attributes ride along verbatim; the filter
/// pass touches many of them, so the tree is not lowered to strings until
/// the final write.
#[derive(Clone, Debug)]
pub struct Element {
    pub name: QName,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.name.local == local
            && self
                .name
                .namespace
                .as_deref()
                .map_or(namespace == SVG_NS && self.name.prefix.is_none(), |ns| {
                    ns == namespace
                })
    }

    pub fn attribute(&self, namespace: Option<&str>, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name.local == local && attr.name.namespace.as_deref() == namespace)
            .map(|attr| attr.value.as_str())
    }

    /// Set a non-namespaced attribute, appending it when absent.
    pub fn set_attribute(&mut self, local: &str, value: &str) {
        if let Some(attr) = self
            .attributes
            .iter_mut()
            .find(|attr| attr.name.local == local && attr.name.namespace.is_none())
        {
            attr.value = value.to_string();
            return;
        }
        self.attributes.push(Attribute {
            name: QName::local(local),
            value: value.to_string(),
        });
    }

    pub fn remove_attribute(&mut self, namespace: Option<&str>, local: &str) {
        self.attributes
            .retain(|attr| !(attr.name.local == local && attr.name.namespace.as_deref() == namespace));
    }

    /// The element's child elements, mutably.
    pub fn child_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }
}

/// A parsed SVG document with the namespace declarations of its root.
#[derive(Clone, Debug)]
pub struct SvgTree {
    pub root: Element,
    /// `(prefix, uri)` pairs declared at the root; `None` is the default
    /// namespace.
    namespaces: Vec<(Option<String>, String)>,
}

fn parse_error(detail: &str) -> ScanariumError {
    ScanariumError::with_parameters(
        ErrorKind::Value,
        "Failed to parse SVG: {detail}",
        &[("detail", detail)],
    )
}

fn convert_element(node: roxmltree::Node) -> Element {
    let namespace = node.tag_name().namespace().map(str::to_string);
    let prefix = namespace
        .as_deref()
        .and_then(|uri| node.lookup_prefix(uri))
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string);

    let attributes = node
        .attributes()
        .map(|attr| {
            let attr_namespace = attr.namespace().map(str::to_string);
            let attr_prefix = attr_namespace
                .as_deref()
                .and_then(|uri| node.lookup_prefix(uri))
                .filter(|prefix| !prefix.is_empty())
                .map(str::to_string);
            Attribute {
                name: QName {
                    prefix: attr_prefix,
                    local: attr.name().to_string(),
                    namespace: attr_namespace,
                },
                value: attr.value().to_string(),
            }
        })
        .collect();

    let children = node
        .children()
        .filter_map(|child| {
            if child.is_element() {
                Some(Node::Element(convert_element(child)))
            } else if child.is_text() {
                child.text().map(|text| Node::Text(text.to_string()))
            } else {
                None
            }
        })
        .collect();

    Element {
        name: QName {
            prefix,
            local: node.tag_name().name().to_string(),
            namespace,
        },
        attributes,
        children,
    }
}

impl SvgTree {
    pub fn parse(text: &str) -> Result<SvgTree> {
        let document =
            roxmltree::Document::parse(text).map_err(|error| parse_error(&error.to_string()))?;
        let root_node = document.root_element();
        let namespaces = root_node
            .namespaces()
            .map(|ns| {
                (
                    ns.name().filter(|prefix| !prefix.is_empty()).map(str::to_string),
                    ns.uri().to_string(),
                )
            })
            .collect();
        Ok(SvgTree {
            root: convert_element(root_node),
            namespaces,
        })
    }

    pub fn parse_file(path: &Path) -> Result<SvgTree> {
        let text = fs::read_to_string(path).map_err(|_| {
            ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to read SVG \"{file_name}\"",
                &[("file_name", &path.display().to_string())],
            )
        })?;
        SvgTree::parse(&text)
            .map_err(|error| error.with_private("file", &path.display().to_string()))
    }

    /// Adopt namespace declarations from another document (used when its
    /// layers get appended here).
    pub fn merge_namespaces(&mut self, other: &SvgTree) {
        for (prefix, uri) in &other.namespaces {
            if !self.namespaces.iter().any(|(p, _)| p == prefix) {
                self.namespaces.push((prefix.clone(), uri.clone()));
            }
        }
    }

    pub fn to_string(&self) -> String {
        let options = Options {
            indent: Indent::None,
            ..Options::default()
        };
        let mut writer = XmlWriter::new(options);
        writer.write_declaration();
        write_element(&mut writer, &self.root, Some(&self.namespaces));
        writer.end_document()
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string()).map_err(|error| {
            ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to write SVG \"{file_name}\": {error}",
                &[
                    ("file_name", &path.display().to_string()),
                    ("error", &error.to_string()),
                ],
            )
        })
    }
}

fn write_element(
    writer: &mut XmlWriter,
    element: &Element,
    namespaces: Option<&[(Option<String>, String)]>,
) {
    writer.start_element(&element.name.qualified());
    if let Some(namespaces) = namespaces {
        for (prefix, uri) in namespaces {
            let name = match prefix {
                Some(prefix) => format!("xmlns:{prefix}"),
                None => "xmlns".to_string(),
            };
            writer.write_attribute(&name, uri);
        }
    }
    for attribute in &element.attributes {
        writer.write_attribute(&attribute.name.qualified(), &attribute.value);
    }
    for child in &element.children {
        match child {
            Node::Element(child) => write_element(writer, child, None),
            Node::Text(text) => writer.write_text(text),
        }
    }
    writer.end_element();
}

/// Split a `style` attribute into ordered key/value settings.
pub fn parse_style(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|setting| {
            let setting = setting.trim();
            if setting.is_empty() {
                return None;
            }
            let (key, value) = setting.split_once(':')?;
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

pub fn join_style(settings: &[(String, String)]) -> String {
    settings
        .iter()
        .map(|(key, value)| format!("{key}:{value}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Update one setting in a style list, appending it when absent.
pub fn set_style(settings: &mut Vec<(String, String)>, key: &str, value: &str) {
    for (existing, existing_value) in settings.iter_mut() {
        if existing.as_str() == key {
            *existing_value = value.to_string();
            return;
        }
    }
    settings.push((key.to_string(), value.to_string()));
}
