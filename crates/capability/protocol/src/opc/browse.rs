//! 递归浏览地址空间

use crate::error::ProtocolError;
use crate::opc::session::{BrowseEntry, BrowsePage, NodeClass, OpcSession};
use std::collections::HashSet;

/// 浏览结果中的一个节点（扁平列表，按发现顺序）
#[derive(Debug, Clone, PartialEq)]
pub struct BrowsedNode {
    pub node_id: String,
    pub parent_id: String,
    pub browse_name: String,
    pub display_name: String,
    pub node_class: NodeClass,
    pub depth: usize,
    /// 仅变量节点有值
    pub data_type: Option<String>,
}

/// 浏览一个节点的全部子引用，直到延续点耗尽
async fn browse_children(
    session: &dyn OpcSession,
    node_id: &str,
) -> Result<Vec<BrowseEntry>, ProtocolError> {
    let BrowsePage {
        mut entries,
        mut continuation,
    } = session.browse(node_id).await?;
    while let Some(point) = continuation.take() {
        if point.is_empty() {
            break;
        }
        let page = session.browse_next(&point).await?;
        entries.extend(page.entries);
        continuation = page.continuation;
    }
    Ok(entries)
}

/// 从 `root` 开始向下浏览（只沿对象节点展开），最后一次批量读取所有变量节点的数据类型
pub async fn browse_tree(
    session: &dyn OpcSession,
    root: &str,
    max_depth: usize,
) -> Result<Vec<BrowsedNode>, ProtocolError> {
    let mut nodes = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(root.to_string());
    let mut stack = vec![(root.to_string(), 0usize)];

    while let Some((parent, depth)) = stack.pop() {
        let children = browse_children(session, &parent).await?;
        // 逆序压栈，保持深度优先时的兄弟顺序
        let mut expand = Vec::new();
        for child in children {
            if !visited.insert(child.node_id.clone()) {
                continue;
            }
            if child.node_class == NodeClass::Object && depth + 1 < max_depth {
                expand.push(child.node_id.clone());
            }
            nodes.push(BrowsedNode {
                node_id: child.node_id,
                parent_id: parent.clone(),
                browse_name: child.browse_name,
                display_name: child.display_name,
                node_class: child.node_class,
                depth: depth + 1,
                data_type: None,
            });
        }
        stack.extend(expand.into_iter().rev().map(|id| (id, depth + 1)));
    }

    let variable_ids: Vec<String> = nodes
        .iter()
        .filter(|node| node.node_class == NodeClass::Variable)
        .map(|node| node.node_id.clone())
        .collect();
    if !variable_ids.is_empty() {
        let data_types = session.read_data_types(&variable_ids).await?;
        let mut data_types = variable_ids.into_iter().zip(data_types);
        for node in nodes
            .iter_mut()
            .filter(|node| node.node_class == NodeClass::Variable)
        {
            if let Some((_, data_type)) = data_types.next() {
                node.data_type = data_type;
            }
        }
    }
    Ok(nodes)
}
