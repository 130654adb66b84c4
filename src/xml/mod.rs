//! Arena-backed markup tree.
//!
//! Parses XML with `quick-xml`'s namespace-aware reader into a flat
//! [`Document`] where every node has a synthetic [`NodeId`]. Nodes are
//! pushed in document order, so comparing ids compares document position.
//! Comments, processing instructions, and doctype declarations are dropped.

pub mod selector;

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use thiserror::Error;

/// Index of a node inside a [`Document`].
pub type NodeId = usize;

#[derive(Debug, Error)]
#[error("invalid markup: {0}")]
pub struct MarkupError(pub String);

#[derive(Debug, Clone)]
pub struct Attribute {
    /// Attribute name as written, including any prefix.
    pub name: String,
    /// Name with the prefix removed.
    pub local: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Element {
    pub local: String,
    pub prefix: Option<String>,
    pub namespace: Option<String>,
    pub attrs: Vec<Attribute>,
}

impl Element {
    /// Attribute lookup by local name or full (prefixed) name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name || a.local == name)
            .map(|a| a.value.as_str())
    }

    /// Tag as written in the source, `prefix:local` when prefixed.
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}:{}", p, self.local),
            None => self.local.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// The document node above the root element.
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root_element: NodeId,
}

impl Document {
    /// Parse a complete XML document.
    pub fn parse(xml: &str) -> Result<Self, MarkupError> {
        let mut reader = NsReader::from_str(xml);
        let mut nodes = vec![Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Document,
        }];
        let mut stack: Vec<NodeId> = vec![0];
        let mut root_element: Option<NodeId> = None;

        loop {
            let (resolved, event) = reader
                .read_resolved_event()
                .map_err(|e| MarkupError(e.to_string()))?;
            let namespace = match resolved {
                ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
                ResolveResult::Unbound => None,
                ResolveResult::Unknown(prefix) => {
                    return Err(MarkupError(format!(
                        "unbound namespace prefix '{}'",
                        String::from_utf8_lossy(&prefix)
                    )))
                }
            };

            match event {
                Event::Start(start) => {
                    let id = push_element(&mut nodes, &stack, &mut root_element, &start, namespace)?;
                    stack.push(id);
                }
                Event::Empty(start) => {
                    push_element(&mut nodes, &stack, &mut root_element, &start, namespace)?;
                }
                Event::End(_) => {
                    if stack.len() <= 1 {
                        return Err(MarkupError("unexpected closing tag".to_string()));
                    }
                    stack.pop();
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| MarkupError(e.to_string()))?
                        .into_owned();
                    push_text(&mut nodes, &stack, text)?;
                }
                Event::CData(data) => {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    push_text(&mut nodes, &stack, text)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if stack.len() > 1 {
            return Err(MarkupError("unexpected end of document: unclosed element".to_string()));
        }
        let root_element =
            root_element.ok_or_else(|| MarkupError("document has no root element".to_string()))?;

        Ok(Self { nodes, root_element })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The document node (parent of the root element).
    pub fn document_node(&self) -> NodeId {
        0
    }

    pub fn root_element(&self) -> NodeId {
        self.root_element
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id].kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Child elements in document order, skipping text.
    pub fn child_elements(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(move |c| matches!(self.nodes[*c].kind, NodeKind::Element(_)))
    }

    /// Ancestors from nearest to farthest, including the document node.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.nodes[id].parent, move |p| self.nodes[*p].parent)
    }

    /// All descendants in document order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id].children.iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.nodes[n].children.iter().rev().copied());
        }
        out
    }

    /// Depth below the document node; the root element has depth 1.
    pub fn depth(&self, id: NodeId) -> usize {
        self.ancestors(id).count()
    }

    /// XPath string-value: concatenated text of all descendant text nodes.
    pub fn string_value(&self, id: NodeId) -> String {
        match &self.nodes[id].kind {
            NodeKind::Text(t) => t.clone(),
            _ => {
                let mut out = String::new();
                for d in self.descendants(id) {
                    if let NodeKind::Text(t) = &self.nodes[d].kind {
                        out.push_str(t);
                    }
                }
                out
            }
        }
    }

    /// Text directly owned by an element: its leading text plus the tail text
    /// after each child, excluding anything inside child elements.
    pub fn direct_text(&self, id: NodeId) -> Option<String> {
        let parts: Vec<&str> = self.nodes[id]
            .children
            .iter()
            .filter_map(|c| match &self.nodes[*c].kind {
                NodeKind::Text(t) => Some(t.trim()),
                _ => None,
            })
            .filter(|t| !t.is_empty())
            .collect();
        let joined = parts.join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}

fn push_element(
    nodes: &mut Vec<Node>,
    stack: &[NodeId],
    root_element: &mut Option<NodeId>,
    start: &BytesStart<'_>,
    namespace: Option<String>,
) -> Result<NodeId, MarkupError> {
    let parent = *stack.last().unwrap_or(&0);
    if parent == 0 && root_element.is_some() {
        return Err(MarkupError("multiple root elements".to_string()));
    }

    let name = start.name();
    let local = String::from_utf8_lossy(name.local_name().as_ref()).into_owned();
    let prefix = name
        .prefix()
        .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());

    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| MarkupError(e.to_string()))?;
        let full = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if full == "xmlns" || full.starts_with("xmlns:") {
            continue;
        }
        let local = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| MarkupError(e.to_string()))?
            .into_owned();
        attrs.push(Attribute {
            name: full,
            local,
            value,
        });
    }

    let id = nodes.len();
    nodes.push(Node {
        parent: Some(parent),
        children: Vec::new(),
        kind: NodeKind::Element(Element {
            local,
            prefix,
            namespace,
            attrs,
        }),
    });
    nodes[parent].children.push(id);
    if parent == 0 {
        *root_element = Some(id);
    }
    Ok(id)
}

fn push_text(nodes: &mut Vec<Node>, stack: &[NodeId], text: String) -> Result<(), MarkupError> {
    let parent = *stack.last().unwrap_or(&0);
    if parent == 0 {
        if text.trim().is_empty() {
            return Ok(());
        }
        return Err(MarkupError("text outside the root element".to_string()));
    }
    if text.is_empty() {
        return Ok(());
    }
    let id = nodes.len();
    nodes.push(Node {
        parent: Some(parent),
        children: Vec::new(),
        kind: NodeKind::Text(text),
    });
    nodes[parent].children.push(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_builds_arena_in_document_order() {
        let doc = Document::parse("<a x='1'>hi<b>there</b>tail<c/></a>").unwrap();
        let root = doc.root_element();
        assert_eq!(doc.element(root).unwrap().local, "a");
        assert_eq!(doc.element(root).unwrap().attr("x"), Some("1"));
        let kids: Vec<_> = doc.child_elements(root).collect();
        assert_eq!(kids.len(), 2);
        assert!(kids[0] < kids[1]);
        assert_eq!(doc.string_value(root), "hitheretail");
    }

    #[test]
    fn test_direct_text_excludes_descendants() {
        let doc = Document::parse("<p>  lead <i>inner</i> tail </p>").unwrap();
        assert_eq!(doc.direct_text(doc.root_element()).as_deref(), Some("lead tail"));
        let doc = Document::parse("<p><i>inner</i></p>").unwrap();
        assert_eq!(doc.direct_text(doc.root_element()), None);
    }

    #[test]
    fn test_namespaces_and_entities() {
        let doc = Document::parse(
            r#"<t:book xmlns:t="urn:test"><t:ch n="1">A &amp; B</t:ch></t:book>"#,
        )
        .unwrap();
        let root = doc.element(doc.root_element()).unwrap();
        assert_eq!(root.local, "book");
        assert_eq!(root.prefix.as_deref(), Some("t"));
        assert_eq!(root.namespace.as_deref(), Some("urn:test"));
        assert_eq!(doc.string_value(doc.root_element()), "A & B");
    }

    #[test]
    fn test_comments_are_dropped() {
        let doc = Document::parse("<a><!-- note --><?pi x?><b/></a>").unwrap();
        assert_eq!(doc.child_elements(doc.root_element()).count(), 1);
    }

    #[test]
    fn test_malformed_markup_is_rejected() {
        assert!(Document::parse("<a><b></a>").is_err());
        assert!(Document::parse("<a>").is_err());
        assert!(Document::parse("").is_err());
        assert!(Document::parse("<a/><b/>").is_err());
    }
}
