// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use anyhow::{Context, Result, anyhow};
use quick_xml::{
    Reader, Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};

use crate::error::RequestError;

/// A child of an element: nested element or character data.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlChild {
    Element(XmlNode),
    Text(String),
}

/// An owned XML element tree, the unit every protocol layer works with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlChild>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn attr(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.push((name.into(), value.to_string()));
        self
    }

    pub fn child(mut self, child: XmlNode) -> Self {
        self.children.push(XmlChild::Element(child));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlChild::Text(text.into()));
        self
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl ToString) {
        self.attrs.push((name.into(), value.to_string()));
    }

    pub fn push(&mut self, child: XmlNode) {
        self.children.push(XmlChild::Element(child));
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value or a typed `missing required field` error.
    pub fn req_attr(&self, name: &str) -> Result<&str, RequestError> {
        self.get_attr(name)
            .ok_or_else(|| RequestError::MissingField(name.to_string()))
    }

    /// Parses an attribute, mapping failures to `invalid attribute`.
    pub fn parse_attr<T: std::str::FromStr>(&self, name: &str) -> Result<T, RequestError> {
        let raw = self.req_attr(name)?;
        raw.parse().map_err(|_| RequestError::InvalidAttribute {
            attribute: name.to_string(),
            value: raw.to_string(),
        })
    }

    pub fn elements(&self) -> impl Iterator<Item = &XmlNode> {
        self.children.iter().filter_map(|c| match c {
            XmlChild::Element(e) => Some(e),
            XmlChild::Text(_) => None,
        })
    }

    pub fn first_element(&self) -> Option<&XmlNode> {
        self.elements().next()
    }

    pub fn find_child(&self, name: &str) -> Option<&XmlNode> {
        self.elements().find(|e| e.name == name)
    }

    /// Concatenated character data of the direct children.
    pub fn inner_text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let XmlChild::Text(t) = child {
                out.push_str(t);
            }
        }
        out
    }

    /// Serializes the element (without an XML declaration).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());
        self.write_into(&mut writer)
            .expect("writing XML to memory cannot fail");
        writer.into_inner()
    }

    fn write_into(&self, writer: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (name, value) in &self.attrs {
            start.push_attribute((name.as_str(), value.as_str()));
        }

        if self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        for child in &self.children {
            match child {
                XmlChild::Element(e) => e.write_into(writer)?,
                XmlChild::Text(t) => {
                    writer.write_event(Event::Text(BytesText::new(t)))?;
                },
            }
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }

    /// Serializes an opening tag only (used for the `<stream:stream>`
    /// header, which stays open for the connection's lifetime).
    pub fn to_open_tag_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .expect("writing XML to memory cannot fail");
        let mut start = BytesStart::new(self.name.as_str());
        for (name, value) in &self.attrs {
            start.push_attribute((name.as_str(), value.as_str()));
        }
        writer
            .write_event(Event::Start(start))
            .expect("writing XML to memory cannot fail");
        writer.into_inner()
    }

    /// Parses one complete element from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<XmlNode> {
        let mut reader = Reader::from_reader(bytes);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(start)) => {
                    stack.push(node_from_start(&start)?);
                },
                Ok(Event::Empty(start)) => {
                    let node = node_from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.push(node),
                        None => return Ok(node),
                    }
                },
                Ok(Event::End(_)) => {
                    let node = stack.pop().context("unbalanced end tag")?;
                    match stack.last_mut() {
                        Some(parent) => parent.push(node),
                        None => return Ok(node),
                    }
                },
                Ok(Event::Text(text)) => {
                    if let Some(parent) = stack.last_mut() {
                        let decoded = text
                            .unescape()
                            .map_err(|e| anyhow!("bad character data: {e}"))?;
                        if !decoded.is_empty() {
                            parent.children.push(XmlChild::Text(decoded.into_owned()));
                        }
                    }
                },
                Ok(Event::CData(data)) => {
                    if let Some(parent) = stack.last_mut() {
                        let decoded = String::from_utf8(data.to_vec())
                            .context("CDATA is not valid UTF-8")?;
                        parent.children.push(XmlChild::Text(decoded));
                    }
                },
                Ok(Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_)) => {},
                Ok(Event::Eof) => {
                    return Err(anyhow!("truncated XML: no complete root element"));
                },
                Err(e) => return Err(anyhow!("malformed XML: {e}")),
            }
            buf.clear();
        }
    }
}

fn node_from_start(start: &BytesStart<'_>) -> Result<XmlNode> {
    let name = String::from_utf8(start.name().as_ref().to_vec())
        .context("element name is not valid UTF-8")?;
    let mut node = XmlNode::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| anyhow!("malformed attribute: {e}"))?;
        let key = String::from_utf8(attr.key.as_ref().to_vec())
            .context("attribute name is not valid UTF-8")?;
        let raw = String::from_utf8(attr.value.to_vec())
            .context("attribute value is not valid UTF-8")?;
        let value = quick_xml::escape::unescape(&raw)
            .map_err(|e| anyhow!("bad attribute value: {e}"))?;
        node.attrs.push((key, value.into_owned()));
    }
    Ok(node)
}

impl fmt::Display for XmlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}
