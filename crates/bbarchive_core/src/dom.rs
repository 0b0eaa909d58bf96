use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};
use html5ever::driver::ParseOpts;
use html5ever::serialize::{SerializeOpts, TraversalScope, serialize};
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::{Attribute, LocalName, Namespace, QualName, parse_document, parse_fragment};
use markup5ever_rcdom::{Node, NodeData, RcDom, SerializableHandle};
use regex::Regex;

pub use markup5ever_rcdom::Handle;

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

pub struct Document {
    dom: RcDom,
}

impl Document {
    pub fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), ParseOpts::default()).one(html);
        Self { dom }
    }

    pub fn to_html(&self) -> Result<String> {
        let mut bytes = Vec::new();
        serialize(
            &mut bytes,
            &SerializableHandle::from(self.dom.document.clone()),
            SerializeOpts::default(),
        )
        .context("failed to serialize document")?;
        String::from_utf8(bytes).context("serialized document is not valid UTF-8")
    }

    pub fn find_all(&self, selector: &Selector) -> Vec<Handle> {
        find_all(&self.dom.document, selector)
    }

    pub fn find_first(&self, selector: &Selector) -> Option<Handle> {
        descendants(&self.dom.document)
            .into_iter()
            .find(|node| selector.matches(node))
    }

    pub fn find_by_id(&self, id: &str) -> Option<Handle> {
        self.find_first(&Selector::any().with_id(id))
    }

    pub fn head(&self) -> Option<Handle> {
        self.find_first(&Selector::tag("head"))
    }

    pub fn body(&self) -> Option<Handle> {
        self.find_first(&Selector::tag("body"))
    }

    /// Comments that precede the root element, such as the JSP source markers
    /// Blackboard emits right after the doctype.
    pub fn leading_comments(&self) -> Vec<String> {
        let mut comments = Vec::new();
        for child in self.dom.document.children.borrow().iter() {
            match &child.data {
                NodeData::Comment { contents } => comments.push(contents.to_string()),
                NodeData::Element { .. } => break,
                _ => {}
            }
        }
        comments
    }
}

#[derive(Debug, Clone)]
enum AttrFilter {
    Present(String),
    Equals(String, String),
    Matches(String, Regex),
}

/// Element predicate used to locate nodes: every configured condition must hold.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    tag: Option<String>,
    id: Option<String>,
    id_pattern: Option<Regex>,
    class: Option<String>,
    attrs: Vec<AttrFilter>,
    text_pattern: Option<Regex>,
}

impl Selector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn tag(name: &str) -> Self {
        Self {
            tag: Some(name.to_ascii_lowercase()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_id_pattern(mut self, pattern: Regex) -> Self {
        self.id_pattern = Some(pattern);
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn with_attr(mut self, name: &str) -> Self {
        self.attrs.push(AttrFilter::Present(name.to_string()));
        self
    }

    pub fn with_attr_value(mut self, name: &str, value: &str) -> Self {
        self.attrs
            .push(AttrFilter::Equals(name.to_string(), value.to_string()));
        self
    }

    pub fn with_attr_pattern(mut self, name: &str, pattern: Regex) -> Self {
        self.attrs
            .push(AttrFilter::Matches(name.to_string(), pattern));
        self
    }

    pub fn with_text_pattern(mut self, pattern: Regex) -> Self {
        self.text_pattern = Some(pattern);
        self
    }

    pub fn matches(&self, node: &Handle) -> bool {
        let Some(tag) = tag_name(node) else {
            return false;
        };
        if let Some(expected) = &self.tag
            && *expected != tag
        {
            return false;
        }
        if let Some(expected) = &self.id
            && attr(node, "id").as_deref() != Some(expected.as_str())
        {
            return false;
        }
        if let Some(pattern) = &self.id_pattern
            && !attr(node, "id").is_some_and(|id| pattern.is_match(&id))
        {
            return false;
        }
        if let Some(class) = &self.class
            && !has_class(node, class)
        {
            return false;
        }
        for filter in &self.attrs {
            let matched = match filter {
                AttrFilter::Present(name) => attr(node, name).is_some(),
                AttrFilter::Equals(name, value) => attr(node, name).as_deref() == Some(value),
                AttrFilter::Matches(name, pattern) => {
                    attr(node, name).is_some_and(|value| pattern.is_match(&value))
                }
            };
            if !matched {
                return false;
            }
        }
        if let Some(pattern) = &self.text_pattern
            && !pattern.is_match(&text_content(node))
        {
            return false;
        }
        true
    }
}

pub fn parse_fragment_nodes(html: &str) -> Vec<Handle> {
    let dom = parse_fragment(
        RcDom::default(),
        ParseOpts::default(),
        html_name("body"),
        Vec::new(),
    )
    .one(html);
    let root = dom.document.children.borrow().first().cloned();
    let Some(root) = root else {
        return Vec::new();
    };
    let nodes: Vec<Handle> = root.children.borrow().clone();
    for node in &nodes {
        detach(node);
    }
    nodes
}

/// Decode character references the way a browser does inside `<textarea>`.
pub fn unescape_html(text: &str) -> String {
    let dom = parse_fragment(
        RcDom::default(),
        ParseOpts::default(),
        html_name("textarea"),
        Vec::new(),
    )
    .one(text);
    text_content(&dom.document)
}

pub fn outer_html(node: &Handle) -> Result<String> {
    let mut bytes = Vec::new();
    let opts = SerializeOpts {
        traversal_scope: TraversalScope::IncludeNode,
        ..SerializeOpts::default()
    };
    serialize(&mut bytes, &SerializableHandle::from(node.clone()), opts)
        .context("failed to serialize node")?;
    String::from_utf8(bytes).context("serialized node is not valid UTF-8")
}

pub fn descendants(node: &Handle) -> Vec<Handle> {
    let mut elements = Vec::new();
    let mut stack: Vec<Handle> = node.children.borrow().iter().rev().cloned().collect();
    while let Some(current) = stack.pop() {
        if tag_name(&current).is_some() {
            elements.push(current.clone());
        }
        for child in current.children.borrow().iter().rev() {
            stack.push(child.clone());
        }
    }
    elements
}

pub fn find_all(root: &Handle, selector: &Selector) -> Vec<Handle> {
    descendants(root)
        .into_iter()
        .filter(|node| selector.matches(node))
        .collect()
}

pub fn tag_name(node: &Handle) -> Option<String> {
    match &node.data {
        NodeData::Element { name, .. } => Some(name.local.to_string()),
        _ => None,
    }
}

pub fn attr(node: &Handle, name: &str) -> Option<String> {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs
            .borrow()
            .iter()
            .find(|attribute| &*attribute.name.local == name)
            .map(|attribute| attribute.value.to_string()),
        _ => None,
    }
}

pub fn set_attr(node: &Handle, name: &str, value: &str) {
    let NodeData::Element { attrs, .. } = &node.data else {
        return;
    };
    let mut attrs = attrs.borrow_mut();
    if let Some(existing) = attrs
        .iter_mut()
        .find(|attribute| &*attribute.name.local == name)
    {
        existing.value = StrTendril::from_slice(value);
    } else {
        attrs.push(Attribute {
            name: attr_name(name),
            value: StrTendril::from_slice(value),
        });
    }
}

pub fn remove_attr(node: &Handle, name: &str) {
    if let NodeData::Element { attrs, .. } = &node.data {
        attrs
            .borrow_mut()
            .retain(|attribute| &*attribute.name.local != name);
    }
}

pub fn classes(node: &Handle) -> Vec<String> {
    attr(node, "class")
        .map(|value| value.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn has_class(node: &Handle, class: &str) -> bool {
    attr(node, "class").is_some_and(|value| value.split_whitespace().any(|item| item == class))
}

pub fn set_classes(node: &Handle, classes: &[String]) {
    if classes.is_empty() {
        remove_attr(node, "class");
    } else {
        set_attr(node, "class", &classes.join(" "));
    }
}

pub fn text_content(node: &Handle) -> String {
    let mut text = String::new();
    collect_text(node, &mut text);
    text
}

fn collect_text(node: &Handle, out: &mut String) {
    if let NodeData::Text { contents } = &node.data {
        out.push_str(&contents.borrow());
    }
    for child in node.children.borrow().iter() {
        collect_text(child, out);
    }
}

/// Trimmed, non-empty text nodes below `node` in document order.
pub fn stripped_strings(node: &Handle) -> Vec<String> {
    let mut strings = Vec::new();
    let mut stack = vec![node.clone()];
    while let Some(current) = stack.pop() {
        if let NodeData::Text { contents } = &current.data {
            let trimmed = contents.borrow().trim().to_string();
            if !trimmed.is_empty() {
                strings.push(trimmed);
            }
        }
        for child in current.children.borrow().iter().rev() {
            stack.push(child.clone());
        }
    }
    strings
}

pub fn set_text(node: &Handle, text: &str) {
    clear_children(node);
    append(node, create_text(text));
}

pub fn clear_children(node: &Handle) {
    let children = std::mem::take(&mut *node.children.borrow_mut());
    for child in children {
        child.parent.set(None);
    }
}

/// True when the node has nothing left but whitespace text.
pub fn is_effectively_empty(node: &Handle) -> bool {
    node.children.borrow().iter().all(|child| match &child.data {
        NodeData::Text { contents } => contents.borrow().trim().is_empty(),
        _ => false,
    })
}

pub fn parent(node: &Handle) -> Option<Handle> {
    let weak = node.parent.take();
    let parent = weak.as_ref().and_then(|weak| weak.upgrade());
    node.parent.set(weak);
    parent
}

pub fn detach(node: &Handle) {
    let Some(weak) = node.parent.take() else {
        return;
    };
    if let Some(parent) = weak.upgrade() {
        parent
            .children
            .borrow_mut()
            .retain(|child| !Rc::ptr_eq(child, node));
    }
}

pub fn append(parent: &Handle, child: Handle) {
    detach(&child);
    child.parent.set(Some(Rc::downgrade(parent)));
    parent.children.borrow_mut().push(child);
}

pub fn prepend(parent: &Handle, child: Handle) {
    detach(&child);
    child.parent.set(Some(Rc::downgrade(parent)));
    parent.children.borrow_mut().insert(0, child);
}

pub fn replace_with(node: &Handle, replacements: Vec<Handle>) {
    let Some(parent) = parent(node) else {
        return;
    };
    for replacement in &replacements {
        detach(replacement);
    }
    let mut children = parent.children.borrow_mut();
    let Some(index) = children.iter().position(|child| Rc::ptr_eq(child, node)) else {
        return;
    };
    for replacement in &replacements {
        replacement.parent.set(Some(Rc::downgrade(&parent)));
    }
    children.splice(index..=index, replacements);
    drop(children);
    node.parent.set(None);
}

pub fn unwrap(node: &Handle) {
    let children: Vec<Handle> = node.children.borrow().clone();
    replace_with(node, children);
}

pub fn create_element(tag: &str, attrs: &[(&str, &str)]) -> Handle {
    Node::new(NodeData::Element {
        name: html_name(tag),
        attrs: RefCell::new(
            attrs
                .iter()
                .map(|(name, value)| Attribute {
                    name: attr_name(name),
                    value: StrTendril::from_slice(value),
                })
                .collect(),
        ),
        template_contents: RefCell::new(None),
        mathml_annotation_xml_integration_point: false,
    })
}

pub fn create_text(text: &str) -> Handle {
    Node::new(NodeData::Text {
        contents: RefCell::new(StrTendril::from_slice(text)),
    })
}

fn html_name(local: &str) -> QualName {
    QualName::new(None, Namespace::from(HTML_NAMESPACE), LocalName::from(local))
}

fn attr_name(local: &str) -> QualName {
    QualName::new(None, Namespace::from(""), LocalName::from(local))
}
