//! table walks a whole table or index b-tree, hiding the fact that it
//! spans several pages, and hands back the leaf cells in key order.

use std::collections::HashSet;

use tracing::warn;

use super::page::{BTreePage, Cell};
use super::{BTreePageType, Error, PageSource};
use crate::database::PageNum;

/// One leaf cell lifted out of a b-tree, with its payload copied so the
/// result outlives the page cache.
#[derive(Debug, Clone)]
pub struct WalkedCell {
    pub page_number: PageNum,
    pub cell_start_offset: usize,
    /// Present for table b-trees; index b-trees have no rowid.
    pub row_id: Option<i64>,
    pub payload: Vec<u8>,
    pub overflow_first_page: Option<PageNum>,
}

/// The outcome of walking one b-tree: its leaf cells in key order plus the
/// set of pages the tree occupies.
#[derive(Debug, Clone, Default)]
pub struct TableWalk {
    pub cells: Vec<WalkedCell>,
    /// Every interior and leaf page of the tree, in visit order.
    pub page_numbers: Vec<PageNum>,
    /// Just the leaf pages, in visit order. Carving runs over these.
    pub leaf_pages: Vec<PageNum>,
}

/// Walk the b-tree rooted at `root` collecting all leaf cells.
///
/// In lenient mode, pages and cells that fail to decode are logged and
/// skipped; in strict mode the first failure aborts the walk.
pub fn walk<S: PageSource>(source: &S, root: PageNum, strict: bool) -> Result<TableWalk, Error> {
    let mut out = TableWalk::default();
    let mut visited: HashSet<PageNum> = HashSet::new();
    // Children are pushed in reverse so the leftmost pops first and cells
    // come out in key order.
    let mut stack: Vec<PageNum> = vec![root];
    while let Some(page_number) = stack.pop() {
        if page_number == 0 || page_number > source.page_count() {
            if strict {
                return Err(Error::CellParsing {
                    page: page_number,
                    offset: 0,
                    reason: "child pointer outside the database".to_string(),
                });
            }
            warn!(
                component = "btree",
                page = page_number,
                root,
                "child pointer outside the database, skipping subtree"
            );
            continue;
        }
        if !visited.insert(page_number) {
            return Err(Error::BTreeCycle { root, page: page_number });
        }
        let page_bytes = source.page(page_number)?;
        let page = match BTreePage::parse(&page_bytes, page_number, source.usable_page_size(), strict)
        {
            Ok(p) => p,
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!(
                    component = "btree",
                    page = page_number,
                    root,
                    error = %e,
                    "failed to parse page during tree walk, skipping"
                );
                continue;
            }
        };
        out.page_numbers.push(page_number);
        match page.page_type() {
            BTreePageType::TableLeaf | BTreePageType::IndexLeaf => {
                out.leaf_pages.push(page_number);
                for cell in page.cells(source)? {
                    match cell {
                        Cell::TableLeaf(c) => out.cells.push(WalkedCell {
                            page_number,
                            cell_start_offset: c.start_offset,
                            row_id: Some(c.row_id),
                            payload: c.payload.into_owned(),
                            overflow_first_page: c.overflow_first_page,
                        }),
                        Cell::IndexLeaf(c) => out.cells.push(WalkedCell {
                            page_number,
                            cell_start_offset: c.start_offset,
                            row_id: None,
                            payload: c.payload.into_owned(),
                            overflow_first_page: c.overflow_first_page,
                        }),
                        _ => unreachable!("leaf pages hold leaf cells"),
                    }
                }
            }
            BTreePageType::TableInterior | BTreePageType::IndexInterior => {
                let mut children = Vec::with_capacity(page.cell_count() + 1);
                for cell in page.cells(source)? {
                    match cell {
                        Cell::TableInterior(c) => children.push(c.left_child_page),
                        Cell::IndexInterior(c) => {
                            // Index interior cells carry payloads too, but the
                            // walk only needs the key order of leaf entries for
                            // diffing; interior keys reappear in the leaves'
                            // subtree ordering.
                            children.push(c.left_child_page);
                        }
                        _ => unreachable!("interior pages hold interior cells"),
                    }
                }
                if let Some(rm) = page.header().rightmost_pointer {
                    children.push(rm);
                }
                for child in children.into_iter().rev() {
                    stack.push(child);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::test_support::{build_table_leaf, int_record, MemPages};

    fn build_table_interior(page_size: usize, children: &[(PageNum, i64)], rightmost: PageNum) -> Vec<u8> {
        let mut page = vec![0_u8; page_size];
        page[0] = 0x05;
        page[8..12].copy_from_slice(&rightmost.to_be_bytes());
        let mut tail = page_size;
        let mut pointers = Vec::new();
        for (child, key) in children {
            let mut cell = Vec::new();
            cell.extend(child.to_be_bytes());
            cell.extend(crate::varint::encode(*key));
            tail -= cell.len();
            page[tail..tail + cell.len()].copy_from_slice(&cell);
            pointers.push(tail as u16);
        }
        page[3..5].copy_from_slice(&(children.len() as u16).to_be_bytes());
        page[5..7].copy_from_slice(&(tail as u16).to_be_bytes());
        for (i, p) in pointers.iter().enumerate() {
            page[12 + 2 * i..14 + 2 * i].copy_from_slice(&p.to_be_bytes());
        }
        page
    }

    #[test]
    fn test_walk_single_leaf() {
        let src = MemPages::new(512);
        src.insert(2, build_table_leaf(512, &[(1, int_record(&[10])), (2, int_record(&[20]))]));
        let walk = walk(&src, 2, true).unwrap();
        assert_eq!(walk.cells.len(), 2);
        assert_eq!(walk.cells[0].row_id, Some(1));
        assert_eq!(walk.cells[1].row_id, Some(2));
        assert_eq!(walk.leaf_pages, vec![2]);
        assert_eq!(walk.page_numbers, vec![2]);
    }

    #[test]
    fn test_walk_two_level_tree_in_key_order() {
        let src = MemPages::new(512);
        src.insert(2, build_table_interior(512, &[(3, 2)], 4));
        src.insert(3, build_table_leaf(512, &[(1, int_record(&[1])), (2, int_record(&[2]))]));
        src.insert(4, build_table_leaf(512, &[(3, int_record(&[3])), (4, int_record(&[4]))]));
        let walk = walk(&src, 2, true).unwrap();
        let row_ids: Vec<i64> = walk.cells.iter().map(|c| c.row_id.unwrap()).collect();
        assert_eq!(row_ids, vec![1, 2, 3, 4]);
        assert_eq!(walk.leaf_pages, vec![3, 4]);
        assert_eq!(walk.page_numbers, vec![2, 3, 4]);
    }

    #[test]
    fn test_walk_detects_cycle() {
        let src = MemPages::new(512);
        src.insert(2, build_table_interior(512, &[(2, 1)], 2));
        assert!(matches!(walk(&src, 2, true), Err(Error::BTreeCycle { .. })));
    }
}
