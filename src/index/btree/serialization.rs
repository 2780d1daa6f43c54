use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PageId, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, BTreePageType};

// Header layout:
//   0      page_type: u8 (1 = leaf, 2 = internal)
//   1..3   size: u16 (keys for leaves, children for internals)
//   3..5   max_size: u16
//   5..9   parent_page_id: u32
//   9..13  page_id: u32
//   13..17 next_page_id: u32 (leaf chain; INVALID for internals)
const PAGE_TYPE_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 1;
const MAX_SIZE_OFFSET: usize = 3;
const PARENT_OFFSET: usize = 5;
const PAGE_ID_OFFSET: usize = 9;
const NEXT_OFFSET: usize = 13;
const HEADER_SIZE: usize = 17;

const LEAF_TAG: u8 = 1;
const INTERNAL_TAG: u8 = 2;

/// Serialize a node into its page. Keys are bincode-encoded with a u16
/// length prefix; record ids and child pointers are fixed-width.
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
{
    page.data.fill(0);

    page.data[PAGE_TYPE_OFFSET] = match node.page_type {
        BTreePageType::Leaf => LEAF_TAG,
        BTreePageType::Internal => INTERNAL_TAG,
    };
    LittleEndian::write_u16(&mut page.data[SIZE_OFFSET..SIZE_OFFSET + 2], node.size() as u16);
    LittleEndian::write_u16(
        &mut page.data[MAX_SIZE_OFFSET..MAX_SIZE_OFFSET + 2],
        node.max_size as u16,
    );
    LittleEndian::write_u32(
        &mut page.data[PARENT_OFFSET..PARENT_OFFSET + 4],
        node.parent_page_id,
    );
    LittleEndian::write_u32(&mut page.data[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 4], node.page_id);
    LittleEndian::write_u32(&mut page.data[NEXT_OFFSET..NEXT_OFFSET + 4], node.next_page_id);

    let mut offset = HEADER_SIZE;
    for key in &node.keys {
        let key_bytes = bincode::serialize(key)
            .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
        if offset + 2 + key_bytes.len() > PAGE_SIZE {
            return Err(BTreeError::NodeTooLarge);
        }
        LittleEndian::write_u16(&mut page.data[offset..offset + 2], key_bytes.len() as u16);
        offset += 2;
        page.data[offset..offset + key_bytes.len()].copy_from_slice(&key_bytes);
        offset += key_bytes.len();
    }

    match node.page_type {
        BTreePageType::Leaf => {
            for rid in &node.values {
                if offset + 8 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], rid.page_id);
                LittleEndian::write_u32(&mut page.data[offset + 4..offset + 8], rid.slot_num);
                offset += 8;
            }
        }
        BTreePageType::Internal => {
            for &child in &node.children {
                if offset + 4 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], child);
                offset += 4;
            }
        }
    }

    Ok(())
}

/// Deserialize a node from its page
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: DeserializeOwned + Clone + Ord,
{
    let page_type = match page.data[PAGE_TYPE_OFFSET] {
        LEAF_TAG => BTreePageType::Leaf,
        INTERNAL_TAG => BTreePageType::Internal,
        _ => return Err(BTreeError::InvalidPageFormat),
    };
    let size = LittleEndian::read_u16(&page.data[SIZE_OFFSET..SIZE_OFFSET + 2]) as usize;
    let max_size = LittleEndian::read_u16(&page.data[MAX_SIZE_OFFSET..MAX_SIZE_OFFSET + 2]) as usize;
    let parent_page_id = LittleEndian::read_u32(&page.data[PARENT_OFFSET..PARENT_OFFSET + 4]);
    let page_id = LittleEndian::read_u32(&page.data[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 4]);
    let next_page_id = LittleEndian::read_u32(&page.data[NEXT_OFFSET..NEXT_OFFSET + 4]);

    let key_count = match page_type {
        BTreePageType::Leaf => size,
        // Internal size counts children; the first slot has no key.
        BTreePageType::Internal => size.saturating_sub(1),
    };

    let mut offset = HEADER_SIZE;
    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        if offset + 2 > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key_len = LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
        offset += 2;
        if offset + key_len > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key = bincode::deserialize(&page.data[offset..offset + key_len])
            .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
        keys.push(key);
        offset += key_len;
    }

    let mut values = Vec::new();
    let mut children = Vec::new();
    match page_type {
        BTreePageType::Leaf => {
            values.reserve(size);
            for _ in 0..size {
                if offset + 8 > PAGE_SIZE {
                    return Err(BTreeError::InvalidPageFormat);
                }
                let rid_page = LittleEndian::read_u32(&page.data[offset..offset + 4]);
                let rid_slot = LittleEndian::read_u32(&page.data[offset + 4..offset + 8]);
                values.push(Rid::new(rid_page, rid_slot));
                offset += 8;
            }
        }
        BTreePageType::Internal => {
            children.reserve(size);
            for _ in 0..size {
                if offset + 4 > PAGE_SIZE {
                    return Err(BTreeError::InvalidPageFormat);
                }
                children.push(LittleEndian::read_u32(&page.data[offset..offset + 4]));
                offset += 4;
            }
        }
    }

    Ok(BTreeNode {
        page_type,
        page_id,
        parent_page_id,
        max_size,
        next_page_id,
        keys,
        values,
        children,
    })
}

/// Patch just the parent pointer without round-tripping the whole node
pub fn write_parent_pointer(page: &mut Page, parent_page_id: PageId) {
    LittleEndian::write_u32(&mut page.data[PARENT_OFFSET..PARENT_OFFSET + 4], parent_page_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_leaf_round_trip() {
        let mut node = BTreeNode::<i64>::new_leaf(5, 2, 64);
        for i in 0..10i64 {
            node.leaf_insert(i * 3, Rid::new(1, i as u32));
        }
        node.next_page_id = 6;

        let mut page = Page::new(5);
        serialize_node(&node, &mut page).unwrap();
        let restored = deserialize_node::<i64>(&page).unwrap();

        assert!(restored.is_leaf());
        assert_eq!(restored.page_id, 5);
        assert_eq!(restored.parent_page_id, 2);
        assert_eq!(restored.max_size, 64);
        assert_eq!(restored.next_page_id, 6);
        assert_eq!(restored.keys, node.keys);
        assert_eq!(restored.values, node.values);
    }

    #[test]
    fn test_internal_round_trip() {
        let mut node = BTreeNode::<String>::new_internal(3, INVALID_PAGE_ID, 8);
        node.keys = vec!["m".to_string(), "t".to_string()];
        node.children = vec![10, 11, 12];

        let mut page = Page::new(3);
        serialize_node(&node, &mut page).unwrap();
        let restored = deserialize_node::<String>(&page).unwrap();

        assert!(!restored.is_leaf());
        assert_eq!(restored.size(), 3);
        assert_eq!(restored.keys, node.keys);
        assert_eq!(restored.children, node.children);
        assert_eq!(restored.next_page_id, INVALID_PAGE_ID);
    }

    #[test]
    fn test_empty_leaf_round_trip() {
        let node = BTreeNode::<i32>::new_leaf(1, INVALID_PAGE_ID, 16);
        let mut page = Page::new(1);
        serialize_node(&node, &mut page).unwrap();
        let restored = deserialize_node::<i32>(&page).unwrap();
        assert!(restored.keys.is_empty());
        assert!(restored.values.is_empty());
    }

    #[test]
    fn test_oversized_node_rejected() {
        let mut node = BTreeNode::<String>::new_leaf(1, INVALID_PAGE_ID, 4096);
        let big = "x".repeat(512);
        for i in 0..20 {
            node.leaf_insert(format!("{big}{i:04}"), Rid::new(0, i));
        }
        let mut page = Page::new(1);
        assert!(matches!(
            serialize_node(&node, &mut page),
            Err(BTreeError::NodeTooLarge)
        ));
    }

    #[test]
    fn test_parent_pointer_patch() {
        let node = BTreeNode::<i32>::new_leaf(1, 2, 16);
        let mut page = Page::new(1);
        serialize_node(&node, &mut page).unwrap();
        write_parent_pointer(&mut page, 9);
        let restored = deserialize_node::<i32>(&page).unwrap();
        assert_eq!(restored.parent_page_id, 9);
    }

    #[test]
    fn test_garbage_page_rejected() {
        let mut page = Page::new(1);
        page.data[0] = 0xFF;
        assert!(deserialize_node::<i32>(&page).is_err());
    }
}
