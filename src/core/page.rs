use super::error::{PDFError, PDFResult};
use super::object_store::ObjectStore;
use super::primitives::{Dict, PDFObject, Ref};
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Attributes a page inherits from its ancestors in the page tree.
pub const INHERITABLE_KEYS: [&str; 4] = ["Resources", "MediaBox", "CropBox", "Rotate"];

/// US Letter, used when no `/MediaBox` is found.
pub const DEFAULT_MEDIA_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

/// Page tree nodes visited while looking for one page.
const MAX_PAGE_TREE_NODES: usize = 1 << 20;

/// A single page in a PDF document.
///
/// Pages are derived, not stored: the page dictionary plus the attributes
/// inherited from its ancestors (nearest ancestor wins), with indirect
/// inherited values already resolved.
///
/// A page dictionary contains properties like:
/// - MediaBox: The visible area of the page
/// - Resources: Fonts, images, and other resources used by the page
/// - Contents: The content stream(s) that draw the page
/// - Parent: Reference to the parent Pages node
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// The page index (0-based)
    index: usize,

    /// The indirect object reference for this page (if it has one)
    reference: Option<Ref>,

    /// The page dictionary
    dict: Dict,

    /// Inheritable attributes, merged over the ancestors
    inherited: Dict,

    /// Content stream entries in drawing order: references or direct streams
    contents: Vec<PDFObject>,
}

/// Serializable summary of a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub index: usize,
    pub reference: Option<Ref>,
    pub media_box: [f64; 4],
    pub crop_box: [f64; 4],
    pub rotate: i32,
    pub content_streams: usize,
}

impl Page {
    pub fn new(index: usize, reference: Option<Ref>, dict: Dict, inherited: Dict, contents: Vec<PDFObject>) -> Self {
        Page {
            index,
            reference,
            dict,
            inherited,
            contents,
        }
    }

    /// Returns the page index (0-based).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the page's indirect object reference if it has one.
    pub fn reference(&self) -> Option<Ref> {
        self.reference
    }

    /// Returns the page dictionary itself, without inherited entries.
    pub fn dict(&self) -> &Dict {
        &self.dict
    }

    /// Gets a property, falling back to inherited attributes.
    pub fn get(&self, key: &str) -> Option<&PDFObject> {
        self.inherited.get(key).or_else(|| self.dict.get(key))
    }

    /// Gets the Resources dictionary for this page, inherited if needed.
    pub fn resources(&self) -> Option<&PDFObject> {
        self.get("Resources")
    }

    /// Gets the MediaBox for this page.
    ///
    /// MediaBox defines the boundaries of the physical medium on which
    /// the page is to be printed: [llx, lly, urx, ury], normalized so the
    /// lower-left corner comes first.
    pub fn media_box(&self) -> [f64; 4] {
        self.get("MediaBox")
            .and_then(normalize_rect)
            .unwrap_or(DEFAULT_MEDIA_BOX)
    }

    /// CropBox clipped to the MediaBox; the MediaBox when absent or empty.
    pub fn crop_box(&self) -> [f64; 4] {
        let media = self.media_box();
        let Some(crop) = self.get("CropBox").and_then(normalize_rect) else {
            return media;
        };
        let clipped = [
            crop[0].max(media[0]),
            crop[1].max(media[1]),
            crop[2].min(media[2]),
            crop[3].min(media[3]),
        ];
        if clipped[0] < clipped[2] && clipped[1] < clipped[3] {
            clipped
        } else {
            media
        }
    }

    /// Rotation in degrees, one of 0, 90, 180 or 270.
    pub fn rotate(&self) -> i32 {
        let rotate = self.get("Rotate").and_then(PDFObject::as_i64).unwrap_or(0);
        if rotate % 90 != 0 {
            return 0;
        }
        rotate.rem_euclid(360) as i32
    }

    /// Gets the Contents for this page, in drawing order.
    pub fn contents(&self) -> &[PDFObject] {
        &self.contents
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            index: self.index,
            reference: self.reference,
            media_box: self.media_box(),
            crop_box: self.crop_box(),
            rotate: self.rotate(),
            content_streams: self.contents.len(),
        }
    }
}

fn normalize_rect(obj: &PDFObject) -> Option<[f64; 4]> {
    let [x1, y1, x2, y2] = obj.as_number_array::<4>()?;
    Some([x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)])
}

/// Lazily walked page tree with a cache of located pages.
///
/// Finding page `n` descends from the root, skipping whole subtrees whose
/// `/Count` lies before `n`. Nodes already on the walk are not entered
/// twice, so cyclic `/Kids` cannot loop.
pub struct PageTree {
    store: Arc<ObjectStore>,
    root: PDFObject,
    count: usize,
    pages: Mutex<FxHashMap<usize, Page>>,
}

impl PageTree {
    /// Reads `/Pages` from the catalog and determines the page count.
    pub async fn load(store: Arc<ObjectStore>, catalog: &Dict) -> PDFResult<Self> {
        let root = catalog.get("Pages").cloned().unwrap_or(PDFObject::Null);
        let root_dict = store.fetch_if_ref(&root).await?;
        if root_dict.as_dict().is_none() {
            warn!("Catalog has no usable /Pages entry");
        }

        let declared = root_dict
            .get("Count")
            .and_then(PDFObject::as_i64)
            .filter(|&n| n >= 0)
            .map(|n| n as usize);

        let mut tree = PageTree {
            store,
            root,
            count: 0,
            pages: Mutex::new(FxHashMap::default()),
        };
        tree.count = match declared {
            Some(count) => count,
            None => {
                let counted = tree.count_leaves().await?;
                debug!("Page tree has no valid /Count, counted {} pages", counted);
                counted
            }
        };
        Ok(tree)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Locates page `index` (0-based).
    pub async fn get_page(&self, index: usize) -> PDFResult<Page> {
        if index >= self.count {
            return Err(PDFError::Generic(format!(
                "Page index {} out of range (document has {} pages)",
                index, self.count
            )));
        }
        if let Some(page) = self.lock_pages().get(&index) {
            return Ok(page.clone());
        }

        let page = self.find_page(index).await?;
        self.lock_pages().insert(index, page.clone());
        Ok(page)
    }

    async fn find_page(&self, index: usize) -> PDFResult<Page> {
        // (node, inherited attributes of its ancestors)
        let mut stack: Vec<(PDFObject, Dict)> = vec![(self.root.clone(), Dict::new())];
        let mut visited: FxHashSet<Ref> = FxHashSet::default();
        let mut current = 0usize;
        let mut steps = 0usize;

        while let Some((node, inherited)) = stack.pop() {
            steps += 1;
            if steps > MAX_PAGE_TREE_NODES {
                break;
            }
            let reference = node.as_indirect();
            if let Some(r) = reference {
                if !visited.insert(r) {
                    warn!("Page tree node {} is visited twice, skipping", r);
                    continue;
                }
            }
            let object = self.store.fetch_if_ref(&node).await?;
            let Some(dict) = object.as_dict() else {
                warn!("Page tree node {:?} is not a dictionary", reference);
                continue;
            };

            let kids = dict.get("Kids");
            let is_leaf = object.type_name() == Some("Page") || kids.is_none();
            if is_leaf {
                if current == index {
                    return self.build_page(index, reference, dict.clone(), inherited).await;
                }
                current += 1;
                continue;
            }

            if let Some(count) = dict.get("Count").and_then(PDFObject::as_i64) {
                // A node other than the first one whose subtree ends before the
                // target can be skipped whole.
                if count >= 0 && current + count as usize <= index && reference != self.root.as_indirect() {
                    current += count as usize;
                    continue;
                }
            }

            let mut merged = inherited;
            for key in INHERITABLE_KEYS {
                if let Some(value) = dict.get(key) {
                    merged.insert(key.to_string(), value.clone());
                }
            }
            let kids = self.store.fetch_if_ref(kids.unwrap_or(&PDFObject::Null)).await?;
            if let Some(kids) = kids.as_array() {
                for kid in kids.iter().rev() {
                    stack.push((kid.clone(), merged.clone()));
                }
            }
        }

        Err(PDFError::InvalidDocument(format!(
            "Page {} not found in the page tree",
            index
        )))
    }

    async fn build_page(&self, index: usize, reference: Option<Ref>, dict: Dict, ancestors: Dict) -> PDFResult<Page> {
        let mut inherited = Dict::new();
        for key in INHERITABLE_KEYS {
            let Some(value) = dict.get(key).or_else(|| ancestors.get(key)) else {
                continue;
            };
            let value = self.store.resolve_deep(value.clone(), 1).await?;
            inherited.insert(key.to_string(), value);
        }

        let contents = match dict.get("Contents") {
            None | Some(PDFObject::Null) => Vec::new(),
            Some(PDFObject::Array(items)) => items.clone(),
            Some(PDFObject::Ref(r)) => match &*self.store.fetch(*r).await? {
                PDFObject::Array(items) => items.clone(),
                _ => vec![PDFObject::Ref(*r)],
            },
            Some(other) => vec![other.clone()],
        };

        Ok(Page::new(index, reference, dict, inherited, contents))
    }

    /// Counts leaves when `/Count` is unusable.
    async fn count_leaves(&self) -> PDFResult<usize> {
        let mut stack = vec![self.root.clone()];
        let mut visited: FxHashSet<Ref> = FxHashSet::default();
        let mut leaves = 0;
        while let Some(node) = stack.pop() {
            if let Some(r) = node.as_indirect() {
                if !visited.insert(r) || visited.len() > MAX_PAGE_TREE_NODES {
                    continue;
                }
            }
            let object = self.store.fetch_if_ref(&node).await?;
            let Some(dict) = object.as_dict() else {
                continue;
            };
            match dict.get("Kids") {
                Some(kids) if object.type_name() != Some("Page") => {
                    let kids = self.store.fetch_if_ref(kids).await?;
                    if let Some(kids) = kids.as_array() {
                        stack.extend(kids.iter().cloned());
                    }
                }
                _ => leaves += 1,
            }
        }
        Ok(leaves)
    }

    fn lock_pages(&self) -> std::sync::MutexGuard<'_, FxHashMap<usize, Page>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
