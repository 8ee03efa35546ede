//! Named resources used by content streams.
//!
//! Content streams refer to fonts, images and other objects by name
//! (`/F1 Tf`, `/Im0 Do`). The name is looked up in the resource
//! dictionaries in scope ([`ResourceScope`]); the object found is loaded
//! once per document by the [`ResourceResolver`] and handed to operator
//! lists as a shared [`Resource`].

use super::content_stream::Operand;
use super::error::{PDFError, PDFResult};
use super::object_store::ObjectStore;
use super::pending::{Awaiter, PendingTable};
use super::primitives::{Dict, PDFObject, Ref};
use bytes::Bytes;
use indexmap::IndexMap;
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Resource dictionary categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Font,
    XObject,
    ColorSpace,
    ExtGState,
    Shading,
    Pattern,
    Properties,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Font,
        ResourceKind::XObject,
        ResourceKind::ColorSpace,
        ResourceKind::ExtGState,
        ResourceKind::Shading,
        ResourceKind::Pattern,
        ResourceKind::Properties,
    ];

    /// Key of the category in a `/Resources` dictionary.
    pub fn category(self) -> &'static str {
        match self {
            ResourceKind::Font => "Font",
            ResourceKind::XObject => "XObject",
            ResourceKind::ColorSpace => "ColorSpace",
            ResourceKind::ExtGState => "ExtGState",
            ResourceKind::Shading => "Shading",
            ResourceKind::Pattern => "Pattern",
            ResourceKind::Properties => "Properties",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            ResourceKind::Font => "font",
            ResourceKind::XObject => "xobj",
            ResourceKind::ColorSpace => "cs",
            ResourceKind::ExtGState => "gs",
            ResourceKind::Shading => "sh",
            ResourceKind::Pattern => "pat",
            ResourceKind::Properties => "mc",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

/// A loaded resource.
///
/// Indirect resources get ids derived from their reference, so every page
/// using the same font shares one `Resource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    /// Name the resource was first requested under.
    pub name: String,
    pub reference: Option<Ref>,
    pub subtype: Option<String>,
    /// The resource dictionary with references resolved.
    pub dict: IndexMap<String, Operand>,
    /// Decoded stream data (images, shadings, tiling patterns).
    pub data: Option<Bytes>,
    /// Image codec the data is still encoded with, e.g. `DCTDecode`.
    pub encoding: Option<String>,
    /// Content of a form XObject, consumed by the interpreter.
    #[serde(skip)]
    pub form: Option<Arc<FormXObject>>,
}

impl Resource {
    pub fn is_form(&self) -> bool {
        self.form.is_some()
    }

    pub fn is_image_mask(&self) -> bool {
        matches!(
            self.dict.get("ImageMask"),
            Some(Operand::Bool(true))
        )
    }
}

/// A form XObject ready to be interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct FormXObject {
    pub content: Bytes,
    /// The form's own `/Resources`, when it has them.
    pub resources: Option<Arc<ScopeFrame>>,
    pub matrix: [f64; 6],
    pub bbox: Option<[f64; 4]>,
}

pub const IDENTITY_MATRIX: [f64; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

/// One `/Resources` dictionary with its category dictionaries resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeFrame {
    categories: FxHashMap<ResourceKind, Dict>,
}

impl ScopeFrame {
    /// Resolves `resources` (a dictionary or a reference to one) and each of
    /// its category entries. Entries inside a category stay unresolved.
    pub async fn load(store: &Arc<ObjectStore>, resources: Option<&PDFObject>) -> PDFResult<ScopeFrame> {
        let mut frame = ScopeFrame::default();
        let Some(resources) = resources else {
            return Ok(frame);
        };
        let resources = store.fetch_if_ref(resources).await?;
        let Some(dict) = resources.as_dict() else {
            return Ok(frame);
        };
        for kind in ResourceKind::ALL {
            let Some(entry) = dict.get(kind.category()) else {
                continue;
            };
            if let PDFObject::Dictionary(category) = store.fetch_if_ref(entry).await? {
                frame.categories.insert(kind, category);
            }
        }
        Ok(frame)
    }

    pub fn from_categories(categories: impl IntoIterator<Item = (ResourceKind, Dict)>) -> Self {
        ScopeFrame {
            categories: categories.into_iter().collect(),
        }
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&PDFObject> {
        self.categories.get(&kind)?.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Resource dictionaries in scope, innermost last.
///
/// A form XObject with its own `/Resources` pushes a frame that shadows
/// the page's; a form without them sees its caller's.
#[derive(Debug, Clone, Default)]
pub struct ResourceScope {
    frames: Vec<Arc<ScopeFrame>>,
}

impl ResourceScope {
    pub fn new(page: ScopeFrame) -> Self {
        ResourceScope {
            frames: vec![Arc::new(page)],
        }
    }

    pub fn push(&mut self, frame: Arc<ScopeFrame>) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Arc<ScopeFrame>> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Looks `name` up innermost-first.
    pub fn lookup(&self, kind: ResourceKind, name: &str) -> Option<&PDFObject> {
        self.frames.iter().rev().find_map(|frame| frame.get(kind, name))
    }
}

/// Outcome of [`ResourceResolver::request`].
///
/// A pending lookup holds an [`Awaiter`]: the load keeps running for as long
/// as it is held, whether or not anyone is polling it.
pub enum Lookup {
    Ready(Arc<Resource>),
    Pending(Awaiter<Arc<Resource>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ResourceKey {
    Indirect(ResourceKind, Ref),
    /// Inline values are not shared; each request gets its own serial.
    Direct(ResourceKind, u64),
}

/// Per-document loader of resources.
///
/// Requests for the same indirect resource are coalesced into one load,
/// and loaded resources are cached for the lifetime of the document.
pub struct ResourceResolver {
    store: Arc<ObjectStore>,
    loads: PendingTable<ResourceKey, Arc<Resource>>,
    cache: Mutex<FxHashMap<ResourceKey, Arc<Resource>>>,
    serial: AtomicU64,
}

impl ResourceResolver {
    pub fn new(store: Arc<ObjectStore>) -> Arc<Self> {
        Arc::new(ResourceResolver {
            store,
            loads: PendingTable::new("resource"),
            cache: Mutex::new(FxHashMap::default()),
            serial: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Starts (or joins) loading the resource `name` whose value in the
    /// resource dictionary is `value`.
    pub fn request(self: &Arc<Self>, kind: ResourceKind, name: &str, value: &PDFObject) -> Lookup {
        let key = match value {
            PDFObject::Ref(r) => ResourceKey::Indirect(kind, *r),
            _ => ResourceKey::Direct(kind, self.serial.fetch_add(1, Ordering::Relaxed)),
        };
        if let Some(hit) = self.lock_cache().get(&key) {
            return Lookup::Ready(Arc::clone(hit));
        }

        let resolver = Arc::clone(self);
        let name = name.to_string();
        let value = value.clone();
        let load_key = key.clone();
        let awaiter = self.loads.get_or_spawn(
            key.clone(),
            || self.lock_cache().get(&key).cloned(),
            move || resolver.load(load_key, name, value),
        );
        match awaiter.value() {
            Some(resource) => Lookup::Ready(resource),
            None => Lookup::Pending(awaiter),
        }
    }

    /// Loads a resource directly, without going through the interpreter.
    pub async fn resolve(self: &Arc<Self>, kind: ResourceKind, name: &str, value: &PDFObject) -> PDFResult<Arc<Resource>> {
        match self.request(kind, name, value) {
            Lookup::Ready(resource) => Ok(resource),
            Lookup::Pending(awaiter) => awaiter.wait().await,
        }
    }

    /// Number of cached indirect resources.
    pub fn cached_count(&self) -> usize {
        self.lock_cache().len()
    }

    /// Rejects every in-flight load.
    pub fn cancel(&self, reason: &str) {
        self.loads.cancel_all(PDFError::Cancelled(reason.to_string()));
    }

    async fn load(self: Arc<Self>, key: ResourceKey, name: String, value: PDFObject) -> PDFResult<Arc<Resource>> {
        let (kind, reference, id) = match &key {
            ResourceKey::Indirect(kind, r) => (*kind, Some(*r), format!("{}_{}_{}", kind.id_prefix(), r.num, r.generation)),
            ResourceKey::Direct(kind, serial) => (*kind, None, format!("{}_d{}", kind.id_prefix(), serial)),
        };
        debug!("Loading {} resource {} as {}", kind, name, id);

        let object = match reference {
            Some(r) => (*self.store.fetch(r).await?).clone(),
            None => value,
        };
        let resource = Arc::new(self.build(kind, id, name, reference, object).await?);
        if reference.is_some() {
            self.lock_cache().insert(key, Arc::clone(&resource));
        }
        Ok(resource)
    }

    async fn build(
        &self,
        kind: ResourceKind,
        id: String,
        name: String,
        reference: Option<Ref>,
        object: PDFObject,
    ) -> PDFResult<Resource> {
        if object.is_null() {
            return Err(PDFError::MissingObject(reference.unwrap_or(Ref::new(0, 0))));
        }

        let mut resource = Resource {
            id,
            kind,
            name,
            reference,
            subtype: None,
            dict: IndexMap::new(),
            data: None,
            encoding: None,
            form: None,
        };

        match kind {
            ResourceKind::ColorSpace => {
                let resolved = self.store.resolve_deep(object, 4).await?;
                let (family, components) = color_space_info(&resolved);
                resource.subtype = Some(family.clone());
                resource.dict.insert("Family".to_string(), Operand::Name(family));
                resource.dict.insert("Components".to_string(), Operand::Number(components as f64));
                resource.dict.insert("Definition".to_string(), Operand::from_object(&resolved));
            }
            ResourceKind::XObject => {
                let PDFObject::Stream(stream) = self.store.resolve_deep(object, 2).await? else {
                    return Err(PDFError::MalformedObject(format!(
                        "XObject {} is not a stream",
                        resource.name
                    )));
                };
                let subtype = stream.dict.get("Subtype").and_then(PDFObject::as_name).map(str::to_string);
                resource.dict = Operand::dict_from(&stream.dict);
                let decoded = match reference {
                    Some(r) => self.store.decode_stream(r).await?,
                    None => self.store.decode_stream_object(&stream, None).await?,
                };
                if subtype.as_deref() == Some("Form") {
                    let frame = match stream.dict.get("Resources") {
                        Some(resources) => Some(Arc::new(ScopeFrame::load(&self.store, Some(resources)).await?)),
                        None => None,
                    };
                    resource.form = Some(Arc::new(FormXObject {
                        content: decoded.bytes,
                        resources: frame,
                        matrix: stream
                            .dict
                            .get("Matrix")
                            .and_then(PDFObject::as_number_array::<6>)
                            .unwrap_or(IDENTITY_MATRIX),
                        bbox: stream.dict.get("BBox").and_then(PDFObject::as_number_array::<4>),
                    }));
                } else {
                    resource.data = Some(decoded.bytes);
                    resource.encoding = decoded.encoding;
                }
                resource.subtype = subtype;
            }
            ResourceKind::Font
            | ResourceKind::ExtGState
            | ResourceKind::Shading
            | ResourceKind::Pattern
            | ResourceKind::Properties => {
                let resolved = self.store.resolve_deep(object, 3).await?;
                resource.subtype = resolved
                    .get("Subtype")
                    .or_else(|| resolved.get("ShadingType"))
                    .or_else(|| resolved.get("PatternType"))
                    .and_then(|value| match value {
                        PDFObject::Name(name) => Some(name.clone()),
                        PDFObject::Number(n) => Some(n.to_string()),
                        _ => None,
                    });
                if let PDFObject::Stream(stream) = &resolved {
                    let decoded = match reference {
                        Some(r) => self.store.decode_stream(r).await?,
                        None => self.store.decode_stream_object(stream, None).await?,
                    };
                    resource.data = Some(decoded.bytes);
                    resource.dict = Operand::dict_from(&stream.dict);
                } else if let Some(dict) = resolved.as_dict() {
                    resource.dict = Operand::dict_from(dict);
                } else {
                    return Err(PDFError::MalformedObject(format!(
                        "{} resource {} is a {}",
                        kind,
                        resource.name,
                        resolved.kind()
                    )));
                }
            }
        }
        Ok(resource)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, FxHashMap<ResourceKey, Arc<Resource>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Color space names that need no resource lookup, including the
/// abbreviations allowed in inline images.
pub fn is_builtin_color_space(name: &str) -> bool {
    matches!(
        name,
        "DeviceGray" | "DeviceRGB" | "DeviceCMYK" | "Pattern" | "G" | "RGB" | "CMYK" | "Indexed" | "I"
    )
}

/// Family name and number of color components of a resolved color space.
pub fn color_space_info(space: &PDFObject) -> (String, usize) {
    let (family, rest): (&str, &[PDFObject]) = match space {
        PDFObject::Name(name) => (name.as_str(), &[]),
        PDFObject::Array(items) => match items.first().and_then(PDFObject::as_name) {
            Some(name) => (name, &items[1..]),
            None => return ("Unknown".to_string(), 0),
        },
        _ => return ("Unknown".to_string(), 0),
    };

    let components = match family {
        "DeviceGray" | "G" | "CalGray" | "Indexed" | "I" | "Separation" => 1,
        "DeviceRGB" | "RGB" | "CalRGB" | "Lab" => 3,
        "DeviceCMYK" | "CMYK" => 4,
        "ICCBased" => rest
            .first()
            .and_then(|profile| profile.get("N"))
            .and_then(PDFObject::as_usize)
            .or_else(|| {
                let alternate = rest.first()?.get("Alternate")?;
                Some(color_space_info(alternate).1)
            })
            .unwrap_or(3),
        "DeviceN" => rest.first().and_then(PDFObject::as_array).map_or(0, <[PDFObject]>::len),
        "Pattern" => rest.first().map_or(0, |base| color_space_info(base).1),
        _ => 0,
    };
    let family = match family {
        "G" => "DeviceGray",
        "RGB" => "DeviceRGB",
        "CMYK" => "DeviceCMYK",
        "I" => "Indexed",
        other => other,
    };
    (family.to_string(), components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::primitives::StreamObject;

    fn name(s: &str) -> PDFObject {
        PDFObject::Name(s.to_string())
    }

    #[test]
    fn test_color_space_components() {
        assert_eq!(color_space_info(&name("DeviceRGB")), ("DeviceRGB".to_string(), 3));
        assert_eq!(color_space_info(&name("G")), ("DeviceGray".to_string(), 1));

        let mut profile = Dict::new();
        profile.insert("N".to_string(), PDFObject::Number(4.0));
        let icc = PDFObject::Array(vec![
            name("ICCBased"),
            PDFObject::Stream(Box::new(StreamObject::new(profile, Bytes::new(), 0))),
        ]);
        assert_eq!(color_space_info(&icc), ("ICCBased".to_string(), 4));

        let indexed = PDFObject::Array(vec![
            name("Indexed"),
            name("DeviceRGB"),
            PDFObject::Number(255.0),
            PDFObject::String(vec![0; 3]),
        ]);
        assert_eq!(color_space_info(&indexed).1, 1);

        let device_n = PDFObject::Array(vec![
            name("DeviceN"),
            PDFObject::Array(vec![name("Cyan"), name("Spot")]),
            name("DeviceCMYK"),
        ]);
        assert_eq!(color_space_info(&device_n).1, 2);
        assert_eq!(color_space_info(&PDFObject::Number(1.0)).0, "Unknown");
    }

    #[test]
    fn test_scope_lookup_is_innermost_first() {
        let mut page = Dict::new();
        page.insert("F1".to_string(), PDFObject::Ref(Ref::new(10, 0)));
        page.insert("F2".to_string(), PDFObject::Ref(Ref::new(11, 0)));
        let mut form = Dict::new();
        form.insert("F1".to_string(), PDFObject::Ref(Ref::new(20, 0)));

        let mut scope = ResourceScope::new(ScopeFrame::from_categories([(ResourceKind::Font, page)]));
        scope.push(Arc::new(ScopeFrame::from_categories([(ResourceKind::Font, form)])));

        assert_eq!(scope.depth(), 2);
        assert_eq!(scope.lookup(ResourceKind::Font, "F1"), Some(&PDFObject::Ref(Ref::new(20, 0))));
        assert_eq!(scope.lookup(ResourceKind::Font, "F2"), Some(&PDFObject::Ref(Ref::new(11, 0))));
        assert_eq!(scope.lookup(ResourceKind::XObject, "F1"), None);

        scope.pop();
        assert_eq!(scope.lookup(ResourceKind::Font, "F1"), Some(&PDFObject::Ref(Ref::new(10, 0))));
    }

    #[test]
    fn test_builtin_color_spaces() {
        assert!(is_builtin_color_space("DeviceRGB"));
        assert!(is_builtin_color_space("Pattern"));
        assert!(!is_builtin_color_space("CS0"));
    }
}
