use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::b64;
use crate::error::{Result, SiloError};
use crate::id::Id;

/// A serialized directory: the ordered list of its entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

/// One entry inside a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub inode: u64,
    #[serde(default)]
    pub device_id: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub links: u64,
    /// For symlinks: the link target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linktarget: Option<String>,
    /// For device nodes: the combined major/minor device number.
    #[serde(default)]
    pub device: u64,
    /// For regular files: the data blobs making up the content, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Id>,
    /// For directories: the subtree id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_attributes: Option<Vec<ExtendedAttribute>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedAttribute {
    pub name: String,
    #[serde(with = "b64")]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
    Symlink,
    Dev,
    Chardev,
    Fifo,
    Socket,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Insert keeping nodes ordered by name, the canonical tree layout.
    pub fn insert(&mut self, node: Node) {
        let pos = self
            .nodes
            .binary_search_by(|n| n.name.as_str().cmp(&node.name))
            .unwrap_or_else(|p| p);
        self.nodes.insert(pos, node);
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SiloError::Decode("tree", e))
    }

    pub fn from_json(data: &[u8]) -> Result<Tree> {
        serde_json::from_slice(data).map_err(|e| SiloError::Decode("tree", e))
    }
}

impl Node {
    /// A bare node of the given type; the caller fills in metadata.
    pub fn new(name: &str, node_type: NodeType) -> Self {
        Node {
            name: name.to_string(),
            node_type,
            mode: 0,
            mtime: Utc::now(),
            atime: None,
            ctime: None,
            uid: 0,
            gid: 0,
            user: None,
            group: None,
            inode: 0,
            device_id: 0,
            size: 0,
            links: 0,
            linktarget: None,
            device: 0,
            content: Vec::new(),
            subtree: None,
            extended_attributes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_name_order() {
        let mut tree = Tree::new();
        for name in ["zeta", "alpha", "mid"] {
            tree.insert(Node::new(name, NodeType::File));
        }
        let names: Vec<&str> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn json_roundtrip() {
        let mut tree = Tree::new();
        let mut file = Node::new("report.txt", NodeType::File);
        file.size = 12;
        file.content = vec![Id::hash(b"chunk")];
        file.mode = 0o644;
        tree.insert(file);

        let mut dir = Node::new("sub", NodeType::Dir);
        dir.subtree = Some(Id::hash(b"subtree"));
        tree.insert(dir);

        let mut link = Node::new("link", NodeType::Symlink);
        link.linktarget = Some("report.txt".into());
        tree.insert(link);

        let back = Tree::from_json(&tree.to_json().unwrap()).unwrap();
        assert_eq!(back.nodes.len(), 3);
        assert_eq!(back.find("report.txt").unwrap().content.len(), 1);
        assert_eq!(
            back.find("sub").unwrap().subtree,
            Some(Id::hash(b"subtree"))
        );
        assert_eq!(
            back.find("link").unwrap().linktarget.as_deref(),
            Some("report.txt")
        );
    }

    #[test]
    fn node_type_wire_names() {
        for (t, name) in [
            (NodeType::File, "\"file\""),
            (NodeType::Dir, "\"dir\""),
            (NodeType::Symlink, "\"symlink\""),
            (NodeType::Dev, "\"dev\""),
            (NodeType::Chardev, "\"chardev\""),
            (NodeType::Fifo, "\"fifo\""),
            (NodeType::Socket, "\"socket\""),
        ] {
            assert_eq!(serde_json::to_string(&t).unwrap(), name);
        }
    }

    #[test]
    fn xattrs_roundtrip_as_base64() {
        let mut node = Node::new("f", NodeType::File);
        node.extended_attributes = Some(vec![ExtendedAttribute {
            name: "user.comment".into(),
            value: vec![0, 159, 146, 150],
        }]);
        let tree = Tree { nodes: vec![node] };
        let back = Tree::from_json(&tree.to_json().unwrap()).unwrap();
        assert_eq!(
            back.nodes[0].extended_attributes.as_ref().unwrap()[0].value,
            vec![0, 159, 146, 150]
        );
    }
}
