//! Minimal XML tree for provider responses.
//!
//! Query and EC2 responses are read into an [`XmlNode`] tree and then
//! projected onto `serde_json::Value` so typed results can be decoded with
//! serde. REST-XML callers (S3, Route 53) walk the tree directly.

use crate::error::{AwsError, AwsResult};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};
use std::str;

/// One element: local name, concatenated text and child elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

/// Parse a document and return its root element.
pub fn parse(body: &str) -> AwsResult<XmlNode> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                stack.push(XmlNode {
                    name: local_name(e.local_name().as_ref())?,
                    ..Default::default()
                });
            }
            Ok(Event::Empty(ref e)) => {
                let node = XmlNode {
                    name: local_name(e.local_name().as_ref())?,
                    ..Default::default()
                };
                attach(&mut stack, &mut root, node);
            }
            Ok(Event::Text(e)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&e.unescape()?);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if let Some(node) = stack.pop() {
                    attach(&mut stack, &mut root, node);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AwsError::malformed(
                    "xml",
                    &format!("XML error at position {}: {}", reader.buffer_position(), e),
                    0,
                ))
            }
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(AwsError::malformed("xml", &format!("unclosed element <{}>", open.name), 0));
    }
    root.ok_or_else(|| AwsError::malformed("xml", "document has no root element", 0))
}

/// Escape text for an element body of a request document.
pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

fn local_name(raw: &[u8]) -> AwsResult<String> {
    str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| AwsError::malformed("xml", "invalid UTF-8 in tag name", 0))
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            if root.is_none() {
                *root = Some(node);
            }
        }
    }
}

impl XmlNode {
    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text of the first direct child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Depth-first search for the first descendant (or self) named `name`.
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Follow a path of child names, e.g. `["ResourceRecordSets", "ResourceRecordSet"]`.
    pub fn path(&self, names: &[&str]) -> Option<&XmlNode> {
        names.iter().try_fold(self, |node, name| node.child(name))
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.text.is_empty()
    }

    fn is_list(&self) -> bool {
        !self.children.is_empty()
            && self
                .children
                .iter()
                .all(|c| c.name == "item" || c.name == "member")
    }

    /// Project onto JSON.
    ///
    /// * leaves become strings
    /// * an element whose children are all `item` or `member` becomes an array
    /// * repeated child names collapse into an array under that key
    /// * empty elements are dropped from objects
    pub fn to_json(&self) -> Value {
        if self.children.is_empty() {
            return Value::String(self.text.clone());
        }
        if self.is_list() {
            return Value::Array(self.children.iter().map(XmlNode::to_json).collect());
        }
        let mut map = Map::new();
        for child in self.children.iter().filter(|c| !c.is_empty()) {
            if map.contains_key(&child.name) {
                continue;
            }
            let mut same: Vec<Value> = self
                .children_named(&child.name)
                .filter(|c| !c.is_empty())
                .map(XmlNode::to_json)
                .collect();
            let value = if same.len() == 1 {
                same.remove(0)
            } else {
                Value::Array(same)
            };
            map.insert(child.name.clone(), value);
        }
        Value::Object(map)
    }
}

/// Serde helpers for XML-sourced fields, where every scalar is a string.
pub mod de {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn scalar(value: Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn i64_from_str<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(scalar(value).and_then(|s| s.trim().parse().ok()).unwrap_or_default())
    }

    pub fn u64_from_str<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(scalar(value).and_then(|s| s.trim().parse().ok()).unwrap_or_default())
    }

    pub fn bool_from_str<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(scalar(value).map(|s| s.trim().eq_ignore_ascii_case("true")).unwrap_or(false))
    }

    /// Accept either a single object or an array of them.
    pub fn one_or_many<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: serde::de::DeserializeOwned,
    {
        let value = Value::deserialize(d)?;
        let items = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            Value::String(ref s) if s.is_empty() => Vec::new(),
            other => vec![other],
        };
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DESCRIBE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>8f7724cf-496f-496e-8fe3-example</requestId>
    <reservationSet>
        <item>
            <reservationId>r-1234567890abcdef0</reservationId>
            <instancesSet>
                <item><instanceId>i-1</instanceId><instanceState><code>16</code><name>running</name></instanceState></item>
                <item><instanceId>i-2</instanceId><tagSet/></item>
            </instancesSet>
        </item>
    </reservationSet>
</DescribeInstancesResponse>"#;

    #[test]
    fn parses_tree() {
        let root = parse(DESCRIBE).unwrap();
        assert_eq!(root.name, "DescribeInstancesResponse");
        assert_eq!(root.child_text("requestId"), Some("8f7724cf-496f-496e-8fe3-example"));
        let instances = root
            .path(&["reservationSet", "item", "instancesSet"])
            .unwrap();
        assert_eq!(instances.children_named("item").count(), 2);
        assert_eq!(root.find("name").map(|n| n.text.as_str()), Some("running"));
    }

    #[test]
    fn projects_item_lists_to_arrays() {
        let value = parse(DESCRIBE).unwrap().to_json();
        let instances = &value["reservationSet"][0]["instancesSet"];
        assert_eq!(instances[0]["instanceState"], json!({"code": "16", "name": "running"}));
        assert_eq!(instances[1], json!({"instanceId": "i-2"}));
    }

    #[test]
    fn repeated_names_collapse_to_array() {
        let value = parse("<R><Contents><Key>a</Key></Contents><Contents><Key>b</Key></Contents><Contents><Key>c</Key></Contents></R>")
            .unwrap()
            .to_json();
        assert_eq!(value["Contents"], json!([{"Key": "a"}, {"Key": "b"}, {"Key": "c"}]));
    }

    #[test]
    fn unescapes_text_and_cdata() {
        let root = parse("<a><b>x &amp; y</b><c><![CDATA[<raw>]]></c></a>").unwrap();
        assert_eq!(root.child_text("b"), Some("x & y"));
        assert_eq!(root.child_text("c"), Some("<raw>"));
    }

    #[test]
    fn unclosed_document_is_malformed() {
        let err = parse("<a><b>text</b>").unwrap_err();
        assert_eq!(err.code, "MalformedResponse");
    }

    #[test]
    fn empty_document_is_malformed() {
        assert!(parse("").is_err());
        assert!(parse("not xml at all").is_err());
    }

    #[derive(serde::Deserialize)]
    struct Numbers {
        #[serde(deserialize_with = "de::i64_from_str")]
        count: i64,
        #[serde(deserialize_with = "de::bool_from_str")]
        flag: bool,
        #[serde(default, deserialize_with = "de::one_or_many")]
        items: Vec<String>,
    }

    #[test]
    fn string_scalars_decode() {
        let n: Numbers = serde_json::from_value(json!({"count": "42", "flag": "true", "items": "one"})).unwrap();
        assert_eq!(n.count, 42);
        assert!(n.flag);
        assert_eq!(n.items, vec!["one".to_string()]);
    }
}
