//! Structured configuration documents
//!
//! A [`Document`] wraps an XML tree and addresses values with simple field
//! paths: `/`-separated element names below the root, optionally followed by
//! `@attribute`. For a libvirt network:
//!
//! - `name` is the text of `<network><name>`
//! - `bridge@name` is the `name` attribute of `<network><bridge>`
//! - `@connections` is an attribute of the root element
//!
//! Documents come from a [`DocumentStore`] or directly from virsh output,
//! and are written to temporary files when a command needs a path.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{eyre, Context as _},
    Result,
};
use std::fmt;
use std::io::Write as _;
use tempfile::NamedTempFile;

use crate::xml_utils::{self, XmlNode};

/// An editable XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    root: XmlNode,
}

/// Split `a/b@c` into (["a", "b"], Some("c")).
fn split_field(field: &str) -> (Vec<&str>, Option<&str>) {
    let (path, attr) = match field.rsplit_once('@') {
        Some((path, attr)) => (path, Some(attr)),
        None => (field, None),
    };
    let segments = path.split('/').filter(|s| !s.is_empty()).collect();
    (segments, attr)
}

impl Document {
    /// Parse a document from XML text.
    pub fn parse(xml: &str) -> Result<Self> {
        Ok(Self {
            root: xml_utils::parse_xml_dom(xml)?,
        })
    }

    /// Wrap an existing node tree.
    pub fn from_root(root: XmlNode) -> Self {
        Self { root }
    }

    /// The root element.
    pub fn root(&self) -> &XmlNode {
        &self.root
    }

    /// Mutable root element.
    pub fn root_mut(&mut self) -> &mut XmlNode {
        &mut self.root
    }

    fn element(&self, segments: &[&str]) -> Option<&XmlNode> {
        segments
            .iter()
            .try_fold(&self.root, |node, seg| node.child(seg))
    }

    fn element_or_create(&mut self, segments: &[&str]) -> &mut XmlNode {
        let mut node = &mut self.root;
        for seg in segments {
            let idx = match node.children.iter().position(|c| c.name == *seg) {
                Some(idx) => idx,
                None => {
                    node.children.push(XmlNode::new(seg));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx];
        }
        node
    }

    /// Read a field: element text, or attribute value with `@attr`.
    pub fn get(&self, field: &str) -> Option<String> {
        let (segments, attr) = split_field(field);
        let node = self.element(&segments)?;
        match attr {
            Some(attr) => node.attr(attr).map(str::to_owned),
            None => Some(node.text_content().to_owned()),
        }
    }

    /// Write a field, creating any missing elements along the path.
    pub fn set(&mut self, field: &str, value: &str) {
        let (segments, attr) = split_field(field);
        let node = self.element_or_create(&segments);
        match attr {
            Some(attr) => node.set_attr(attr, value),
            None => node.text = value.to_owned(),
        }
    }

    /// Delete a field (all matching elements, or one attribute).
    ///
    /// Returns whether anything was removed.
    pub fn remove(&mut self, field: &str) -> bool {
        let (segments, attr) = split_field(field);
        match attr {
            Some(attr) => {
                let mut node = &mut self.root;
                for seg in &segments {
                    match node.child_mut(seg) {
                        Some(child) => node = child,
                        None => return false,
                    }
                }
                node.remove_attr(attr)
            }
            None => {
                let Some((last, parents)) = segments.split_last() else {
                    return false;
                };
                let mut node = &mut self.root;
                for seg in parents {
                    match node.child_mut(seg) {
                        Some(child) => node = child,
                        None => return false,
                    }
                }
                node.remove_children(last) > 0
            }
        }
    }

    /// All elements matching the last segment of `path`, under the first
    /// match of its parents.
    pub fn nodes(&self, path: &str) -> Vec<&XmlNode> {
        let (segments, _) = split_field(path);
        let Some((last, parents)) = segments.split_last() else {
            return vec![&self.root];
        };
        self.element(parents)
            .map(|parent| parent.children.iter().filter(|c| c.name == *last).collect())
            .unwrap_or_default()
    }

    /// Number of elements at `path`.
    pub fn count(&self, path: &str) -> usize {
        self.nodes(path).len()
    }

    /// Append `node` under the element at `parent_path`, creating it if needed.
    pub fn append(&mut self, parent_path: &str, node: XmlNode) {
        let (segments, _) = split_field(parent_path);
        self.element_or_create(&segments).children.push(node);
    }

    /// Serialize to XML text.
    pub fn serialize(&self) -> Result<String> {
        self.root.to_xml()
    }

    /// Write the document to a fresh temporary file.
    pub fn write_temp(&self) -> Result<XmlTempFile> {
        XmlTempFile::new(&self.serialize()?)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.serialize() {
            Ok(xml) => f.write_str(&xml),
            Err(_) => write!(f, "<{} (unserializable)>", self.root.name),
        }
    }
}

/// An XML file that is deleted when dropped.
#[derive(Debug)]
pub struct XmlTempFile {
    file: NamedTempFile,
    path: Utf8PathBuf,
}

impl XmlTempFile {
    /// Write `content` to a new temporary `.xml` file.
    pub fn new(content: &str) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("virtscen-")
            .suffix(".xml")
            .tempfile()
            .context("Failed to create temporary XML file")?;
        file.write_all(content.as_bytes())
            .and_then(|()| file.flush())
            .context("Failed to write temporary XML file")?;
        let path = Utf8Path::from_path(file.path())
            .ok_or_else(|| eyre!("Temporary path is not UTF-8: {:?}", file.path()))?
            .to_owned();
        Ok(Self { file, path })
    }

    /// Path of the file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Whether the file still exists on disk.
    pub fn exists(&self) -> bool {
        self.file.path().exists()
    }
}

/// Loads and stores documents by path.
pub trait DocumentStore: fmt::Debug + Send + Sync {
    /// Load the document at `path`.
    fn load(&self, path: &Utf8Path) -> Result<Document>;

    /// Store `doc` at `path`, replacing any existing content.
    fn store(&self, path: &Utf8Path, doc: &Document) -> Result<()>;
}

/// Documents as plain files on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDocumentStore;

impl DocumentStore for FsDocumentStore {
    fn load(&self, path: &Utf8Path) -> Result<Document> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read document: {}", path))?;
        Document::parse(&content).with_context(|| format!("Failed to parse document: {}", path))
    }

    fn store(&self, path: &Utf8Path, doc: &Document) -> Result<()> {
        std::fs::write(path, doc.serialize()?)
            .with_context(|| format!("Failed to write document: {}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const NETWORK: &str = indoc! {r#"
        <network connections="1">
          <name>default</name>
          <uuid>7f3f2b6c-1d7e-4c2b-9a36-0d6d0c9c1a11</uuid>
          <forward mode="nat"/>
          <bridge name="virbr0" stp="on" delay="0"/>
          <ip address="192.168.122.1" netmask="255.255.255.0">
            <dhcp>
              <range start="192.168.122.2" end="192.168.122.254"/>
            </dhcp>
          </ip>
        </network>
    "#};

    #[test]
    fn test_get_text_and_attributes() {
        let doc = Document::parse(NETWORK).unwrap();
        assert_eq!(doc.get("name").as_deref(), Some("default"));
        assert_eq!(doc.get("bridge@name").as_deref(), Some("virbr0"));
        assert_eq!(doc.get("@connections").as_deref(), Some("1"));
        assert_eq!(doc.get("ip/dhcp/range@end").as_deref(), Some("192.168.122.254"));
        assert_eq!(doc.get("missing"), None);
        assert_eq!(doc.get("bridge@missing"), None);
    }

    #[test]
    fn test_set_creates_missing_elements() {
        let mut doc = Document::parse(NETWORK).unwrap();
        doc.set("name", "testnet");
        doc.set("bridge@name", "vsbr1");
        doc.set("domain@name", "example.test");
        assert_eq!(doc.get("name").as_deref(), Some("testnet"));
        assert_eq!(doc.get("bridge@name").as_deref(), Some("vsbr1"));
        assert_eq!(doc.get("domain@name").as_deref(), Some("example.test"));

        let reparsed = Document::parse(&doc.serialize().unwrap()).unwrap();
        assert_eq!(reparsed, doc);
    }

    #[test]
    fn test_remove() {
        let mut doc = Document::parse(NETWORK).unwrap();
        assert!(doc.remove("uuid"));
        assert!(!doc.remove("uuid"));
        assert!(doc.remove("bridge@stp"));
        assert!(doc.remove("ip"));
        assert!(!doc.remove("nope/deeper"));
        assert_eq!(doc.get("uuid"), None);
        assert_eq!(doc.count("ip"), 0);
        assert_eq!(doc.get("bridge@stp"), None);
    }

    #[test]
    fn test_nodes_and_append() {
        let mut doc = Document::parse(
            "<domain><devices><disk device=\"disk\"/><interface/></devices></domain>",
        )
        .unwrap();
        assert_eq!(doc.count("devices/disk"), 1);
        doc.append("devices", XmlNode::new("disk").with_attr("device", "lun"));
        assert_eq!(doc.count("devices/disk"), 2);
        let devices: Vec<_> = doc
            .nodes("devices/disk")
            .into_iter()
            .filter_map(|n| n.attr("device"))
            .collect();
        assert_eq!(devices, ["disk", "lun"]);
        assert_eq!(doc.count("nothing/here"), 0);
    }

    #[test]
    fn test_nodes_outlive_path() {
        let doc = Document::parse(NETWORK).unwrap();
        let found = {
            let path = format!("{}/{}", "ip", "dhcp");
            doc.nodes(&path)
        };
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].children[0].attr("start"), Some("192.168.122.2"));

        let dom = doc.root();
        let bridges: Vec<&XmlNode> = {
            let name = String::from("bridge");
            dom.children_named(&name).collect()
        };
        assert_eq!(bridges[0].attr("name"), Some("virbr0"));
    }

    #[test]
    fn test_fs_store_and_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("net.xml")).unwrap();
        let store = FsDocumentStore;

        let mut doc = Document::parse(NETWORK).unwrap();
        doc.set("name", "stored");
        store.store(&path, &doc).unwrap();
        assert_eq!(store.load(&path).unwrap(), doc);
        assert!(store.load(&path.with_file_name("missing.xml")).is_err());

        let temp = doc.write_temp().unwrap();
        assert!(temp.exists());
        assert_eq!(store.load(temp.path()).unwrap(), doc);
        let temp_path = temp.path().to_owned();
        drop(temp);
        assert!(!temp_path.exists());
    }
}
