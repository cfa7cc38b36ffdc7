//! Multi-layer encoders.
//!
//! A `MultiLayerEncoder` is a sequence of named layers. Encoding an image for a
//! set of layers runs the network once, stopping at the deepest requested layer,
//! and keeps every intermediate activation so that other operators asking for
//! the same image can reuse them.
pub mod vgg;

use crate::error::{NstError, Result};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use tch::{nn, Tensor};

pub use vgg::{ModelContext, Pooling, VggArch, VggConfig};

// Identifies an image by its storage. The image is kept alive by its cache
// entry so the pointer cannot be reused by another tensor while cached. A
// detached view of a variable shares its storage but not its gradient path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ImageKey {
    ptr: usize,
    size: Vec<i64>,
    stride: Vec<i64>,
    requires_grad: bool,
}

impl ImageKey {
    fn new(image: &Tensor) -> ImageKey {
        ImageKey {
            ptr: image.data_ptr() as usize,
            size: image.size(),
            stride: image.stride(),
            requires_grad: image.requires_grad(),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    _image: Tensor,
    // Activations for layers 0..encodings.len().
    encodings: Vec<Tensor>,
}

pub struct MultiLayerEncoder {
    layers: Vec<(String, Rc<dyn nn::ModuleT>)>,
    storage: RefCell<HashMap<ImageKey, CacheEntry>>,
    registered: RefCell<BTreeSet<usize>>,
}

impl std::fmt::Debug for MultiLayerEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLayerEncoder").field("layers", &self.layer_names()).finish()
    }
}

impl Default for MultiLayerEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiLayerEncoder {
    pub fn new() -> MultiLayerEncoder {
        MultiLayerEncoder {
            layers: vec![],
            storage: RefCell::new(HashMap::new()),
            registered: RefCell::new(BTreeSet::new()),
        }
    }

    /// Appends a named layer after all the current layers.
    pub fn add<M: nn::ModuleT + 'static>(mut self, name: &str, layer: M) -> Self {
        let layer: Rc<dyn nn::ModuleT> = Rc::new(layer);
        self.layers.push((name.to_string(), layer));
        self
    }

    /// Appends a named closure after all the current layers.
    pub fn add_fn<F>(self, name: &str, f: F) -> Self
    where
        F: 'static + Send,
        F: Fn(&Tensor) -> Tensor,
    {
        self.add(name, nn::func(f))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn contains(&self, layer: &str) -> bool {
        self.layers.iter().any(|(name, _)| name == layer)
    }

    /// Returns the position of a layer in the network.
    pub fn index(&self, layer: &str) -> Result<usize> {
        self.layers.iter().position(|(name, _)| name == layer).ok_or_else(|| {
            NstError::UnknownLayer {
                layer: layer.to_string(),
                available: self.layer_names().join(", "),
            }
        })
    }

    /// Marks a layer as used by some operator, see `trim`.
    pub fn register_layer(&self, layer: &str) -> Result<()> {
        let index = self.index(layer)?;
        self.registered.borrow_mut().insert(index);
        Ok(())
    }

    pub fn registered_layers(&self) -> Vec<&str> {
        self.registered.borrow().iter().map(|&i| self.layers[i].0.as_str()).collect()
    }

    /// Returns the encodings of `image` for each of the given layers.
    pub fn encode<S: AsRef<str>>(&self, image: &Tensor, layers: &[S]) -> Result<Vec<Tensor>> {
        let indexes =
            layers.iter().map(|l| self.index(l.as_ref())).collect::<Result<Vec<_>>>()?;
        let deepest = match indexes.iter().max() {
            Some(&deepest) => deepest,
            None => return Ok(vec![]),
        };
        let key = ImageKey::new(image);
        self.forward_to(&key, image, deepest)?;
        let storage = self.storage.borrow();
        let encodings = &storage[&key].encodings;
        Ok(indexes.iter().map(|&i| encodings[i].shallow_clone()).collect())
    }

    /// Encodes `image` once for several layer collections, returning the
    /// encodings of each collection in order.
    pub fn encode_collections<S: AsRef<str>>(
        &self,
        image: &Tensor,
        collections: &[Vec<S>],
    ) -> Result<Vec<Vec<Tensor>>> {
        let all: Vec<&str> = collections.iter().flatten().map(|l| l.as_ref()).collect();
        let mut encodings = self.encode(image, &all)?.into_iter();
        Ok(collections.iter().map(|c| encodings.by_ref().take(c.len()).collect()).collect())
    }

    fn forward_to(&self, key: &ImageKey, image: &Tensor, deepest: usize) -> Result<()> {
        let mut storage = self.storage.borrow_mut();
        let entry = storage
            .entry(key.clone())
            .or_insert_with(|| CacheEntry { _image: image.shallow_clone(), encodings: vec![] });
        let start = entry.encodings.len();
        if start > deepest {
            return Ok(());
        }
        tracing::debug!(from = start, to = deepest, "encoder forward pass");
        let mut xs = match entry.encodings.last() {
            Some(xs) => xs.shallow_clone(),
            None => image.shallow_clone(),
        };
        for (_, layer) in &self.layers[start..=deepest] {
            xs = layer.forward_t(&xs, false);
            entry.encodings.push(xs.shallow_clone());
        }
        Ok(())
    }

    /// Drops the cached encodings of a single image.
    pub fn release(&self, image: &Tensor) {
        self.storage.borrow_mut().remove(&ImageKey::new(image));
    }

    /// Drops all the cached encodings.
    pub fn clear_storage(&self) {
        self.storage.borrow_mut().clear()
    }

    /// Number of images with cached encodings.
    pub fn num_cached_images(&self) -> usize {
        self.storage.borrow().len()
    }

    /// Builds a new encoder that stops at the deepest of `layers`, or at the
    /// deepest registered layer when `layers` is `None`. The layers are shared
    /// with `self` which is left unchanged.
    pub fn trim(&self, layers: Option<&[&str]>) -> Result<MultiLayerEncoder> {
        let deepest = match layers {
            Some(layers) => layers.iter().map(|l| self.index(l)).collect::<Result<Vec<_>>>()?,
            None => self.registered.borrow().iter().copied().collect(),
        }
        .into_iter()
        .max();
        let deepest = match deepest {
            Some(deepest) => deepest,
            None => return Err(NstError::NotConfigured("no layer to trim the encoder to".into())),
        };
        let registered =
            self.registered.borrow().iter().copied().filter(|&i| i <= deepest).collect();
        Ok(MultiLayerEncoder {
            layers: self.layers[..=deepest].to_vec(),
            storage: RefCell::new(HashMap::new()),
            registered: RefCell::new(registered),
        })
    }
}
