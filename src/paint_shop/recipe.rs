//! Texture recipes and their cache keys.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::error::{Error, Result};
use crate::gpu::ChannelAdjust;

/// Nested layers a recipe may reference from its channel mapping.
pub const MAX_LAYERS: usize = 3;

/// Encoded image bytes, hashed by content once at construction.
#[derive(Clone)]
pub struct RawBytes {
    data: Arc<[u8]>,
    hash: u64,
}

impl RawBytes {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        let hash = xxh3_64(&data);
        Self { data, hash }
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    pub fn content_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for RawBytes {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.data == other.data
    }
}

impl Eq for RawBytes {}

impl Hash for RawBytes {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.data.len().hash(state);
    }
}

impl std::fmt::Debug for RawBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawBytes({} bytes, {:016x})", self.data.len(), self.hash)
    }
}

/// Where a recipe's primary pixels come from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// The texture currently bound to the requested slot of the loaded model.
    InputSlot,
    /// A named entry of the loaded model's texture table (skin-aware).
    NamedEntry(String),
    RawBytes(RawBytes),
    SolidColor([u8; 4]),
}

impl SourceKind {
    pub fn reads_model(&self) -> bool {
        matches!(self, SourceKind::InputSlot | SourceKind::NamedEntry(_))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    R = 0,
    G = 1,
    B = 2,
    A = 3,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::R, Channel::G, Channel::B, Channel::A];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// What feeds one output channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelSource {
    /// Another channel of the primary image.
    Primary(Channel),
    /// A channel of one of the nested layer recipes.
    Layer { layer: u8, channel: Channel },
}

/// Immutable description of how to obtain one texture.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureRecipe {
    pub source: SourceKind,
    pub channels: [Option<ChannelSource>; 4],
    pub layers: Vec<TextureRecipe>,
    pub desaturate: bool,
    pub normalize: bool,
    pub adjust: [ChannelAdjust; 4],
}

impl TextureRecipe {
    pub fn new(source: SourceKind) -> Self {
        Self {
            source,
            channels: [None; 4],
            layers: Vec::new(),
            desaturate: false,
            normalize: false,
            adjust: [ChannelAdjust::Identity; 4],
        }
    }

    pub fn input_slot() -> Self {
        Self::new(SourceKind::InputSlot)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(SourceKind::NamedEntry(name.into()))
    }

    pub fn raw(data: impl Into<Arc<[u8]>>) -> Self {
        Self::new(SourceKind::RawBytes(RawBytes::new(data)))
    }

    pub fn solid(rgba: [u8; 4]) -> Self {
        Self::new(SourceKind::SolidColor(rgba))
    }

    pub fn with_channel(mut self, channel: Channel, source: ChannelSource) -> Self {
        self.channels[channel.index()] = Some(source);
        self
    }

    pub fn with_layer(mut self, layer: TextureRecipe) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn with_adjust(mut self, channel: Channel, adjust: ChannelAdjust) -> Self {
        self.adjust[channel.index()] = adjust;
        self
    }

    pub fn desaturated(mut self) -> Self {
        self.desaturate = true;
        self
    }

    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }

    /// Desaturate or normalize passes are needed.
    pub fn needs_preparation(&self) -> bool {
        self.desaturate || self.normalize
    }

    /// A channel-combine pass is needed.
    pub fn needs_combine(&self) -> bool {
        self.channels.iter().any(Option::is_some)
            || self.adjust.iter().any(|a| *a != ChannelAdjust::Identity)
    }

    /// Nothing but the source itself.
    pub fn is_plain(&self) -> bool {
        !self.needs_preparation() && !self.needs_combine()
    }

    /// This recipe (or one of its layers) reads from the loaded model.
    pub fn reads_model(&self) -> bool {
        self.source.reads_model() || self.layers.iter().any(TextureRecipe::reads_model)
    }

    fn uses_input_slot(&self) -> bool {
        self.source == SourceKind::InputSlot || self.layers.iter().any(TextureRecipe::uses_input_slot)
    }

    /// The same source without any transform.
    pub fn source_only(&self) -> TextureRecipe {
        TextureRecipe::new(self.source.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.layers.len() > MAX_LAYERS {
            return Err(Error::InvalidRecipe(format!(
                "{} layers given, at most {MAX_LAYERS} supported",
                self.layers.len()
            )));
        }
        for source in self.channels.iter().flatten() {
            if let ChannelSource::Layer { layer, .. } = source {
                if *layer as usize >= self.layers.len() {
                    return Err(Error::InvalidRecipe(format!(
                        "channel reads layer {layer}, recipe has {}",
                        self.layers.len()
                    )));
                }
            }
        }
        self.layers.iter().try_for_each(TextureRecipe::validate)
    }

    /// xxh3 over the whole structure.
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl From<SourceKind> for TextureRecipe {
    fn from(source: SourceKind) -> Self {
        TextureRecipe::new(source)
    }
}

/// Everything a cached entry depends on besides the recipe itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyContext<'a> {
    pub model_id: Option<&'a str>,
    pub skin_id: Option<&'a str>,
    pub slot: Option<&'a str>,
}

/// Cache key: recipe hash × max size, with model identity (and slot name for
/// input-slot reads) mixed in so that two cars never share an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecipeKey {
    pub hash: u64,
    pub max_size: Option<u32>,
}

impl RecipeKey {
    pub fn new(recipe: &TextureRecipe, max_size: Option<u32>, ctx: KeyContext<'_>) -> Self {
        let mut hasher = Xxh3::new();
        recipe.hash(&mut hasher);
        if recipe.reads_model() {
            ctx.model_id.hash(&mut hasher);
            ctx.skin_id.hash(&mut hasher);
        }
        if recipe.uses_input_slot() {
            ctx.slot.hash(&mut hasher);
        }
        Self {
            hash: hasher.finish(),
            max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(model: &'a str, slot: &'a str) -> KeyContext<'a> {
        KeyContext {
            model_id: Some(model),
            skin_id: None,
            slot: Some(slot),
        }
    }

    #[test]
    fn test_raw_bytes_hash_by_content() {
        let a = TextureRecipe::raw(vec![1u8, 2, 3]);
        let b = TextureRecipe::raw(vec![1u8, 2, 3]);
        let c = TextureRecipe::raw(vec![1u8, 2, 4]);
        assert_eq!(a, b);
        assert_eq!(a.structural_hash(), b.structural_hash());
        assert_ne!(a.structural_hash(), c.structural_hash());
    }

    #[test]
    fn test_flags_change_hash() {
        let base = TextureRecipe::named("body.png");
        assert_ne!(base.structural_hash(), base.clone().desaturated().structural_hash());
        assert_ne!(
            base.structural_hash(),
            base.clone()
                .with_adjust(Channel::A, ChannelAdjust::Invert)
                .structural_hash()
        );
    }

    #[test]
    fn test_key_mixes_model_and_slot() {
        let slot = TextureRecipe::input_slot();
        let a = RecipeKey::new(&slot, Some(256), ctx("abc", "body"));
        let b = RecipeKey::new(&slot, Some(256), ctx("xyz", "body"));
        let c = RecipeKey::new(&slot, Some(256), ctx("abc", "wheels"));
        let d = RecipeKey::new(&slot, Some(512), ctx("abc", "body"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a, RecipeKey::new(&slot, Some(256), ctx("abc", "body")));

        let solid = TextureRecipe::solid([1, 2, 3, 4]);
        assert_eq!(
            RecipeKey::new(&solid, None, ctx("abc", "body")),
            RecipeKey::new(&solid, None, ctx("xyz", "wheels"))
        );

        let named = TextureRecipe::named("decal.png");
        assert_eq!(
            RecipeKey::new(&named, None, ctx("abc", "body")),
            RecipeKey::new(&named, None, ctx("abc", "wheels"))
        );
        assert_ne!(
            RecipeKey::new(&named, None, ctx("abc", "body")),
            RecipeKey::new(&named, None, ctx("xyz", "body"))
        );
    }

    #[test]
    fn test_validate_layer_refs() {
        let bad = TextureRecipe::solid([0; 4]).with_channel(
            Channel::R,
            ChannelSource::Layer {
                layer: 0,
                channel: Channel::G,
            },
        );
        assert!(matches!(bad.validate(), Err(Error::InvalidRecipe(_))));
        let good = bad.with_layer(TextureRecipe::solid([9; 4]));
        assert!(good.validate().is_ok());
        assert!(good.needs_combine());
        assert!(!good.needs_preparation());
    }
}
