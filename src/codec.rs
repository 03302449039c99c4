//! Payload codec registry.
//!
//! A [`Registry`] maps event names to a factory, an encoder, and a decoder
//! for the payload type registered under that name. Payloads that bring
//! their own byte encoding (the [`EventData::marshal`] /
//! [`EventData::unmarshal`] capability) take precedence over registered
//! encoders and decoders.
//!
//! A process-wide default registry is available through
//! [`default_registry`]; library code should accept a `&Registry` parameter
//! and fall back to the default only when the caller does not provide one.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{OnceLock, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::BoxError;
use crate::event::EventData;

/// Codec lookup and (de)serialization errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No encoding registered under the name.
    #[error("encoding not found for {name:?}; forgot to register?")]
    NotFound { name: String },

    /// No factory registered under the name, so a value cannot be
    /// constructed for decoding.
    #[error("missing factory for {name:?}; forgot to register?")]
    MissingFactory { name: String },

    /// The payload passed for encoding is not the type registered under
    /// the name.
    #[error("payload registered as {name:?} has a different type")]
    TypeMismatch { name: String },

    /// The encoder (or the payload's own `marshal`) failed.
    #[error("encode {name:?}: {source}")]
    Encode { name: String, source: BoxError },

    /// The decoder (or the payload's own `unmarshal`) failed.
    #[error("decode {name:?}: {source}")]
    Decode { name: String, source: BoxError },
}

type ErasedFactory = Box<dyn Fn() -> Box<dyn EventData> + Send + Sync>;
type ErasedEncode = Box<dyn Fn(&mut dyn Write, &dyn EventData) -> Result<(), CodecError> + Send + Sync>;
type ErasedDecode = Box<dyn Fn(&mut dyn Read) -> Result<Box<dyn EventData>, CodecError> + Send + Sync>;

struct Registration {
    factory: ErasedFactory,
    encode: ErasedEncode,
    decode: ErasedDecode,
}

/// Name-keyed payload codec registry.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the codec for payloads named `name`.
    ///
    /// `factory` produces the zero value used as the decode target,
    /// `encode` and `decode` handle the byte representation. Registering
    /// the same name again replaces the previous codec.
    pub fn register<D, F, E, Dec>(&self, name: impl Into<String>, factory: F, encode: E, decode: Dec)
    where
        D: EventData,
        F: Fn() -> D + Send + Sync + 'static,
        E: Fn(&mut dyn Write, &D) -> Result<(), BoxError> + Send + Sync + 'static,
        Dec: Fn(&mut dyn Read) -> Result<D, BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        let enc_name = name.clone();
        let dec_name = name.clone();

        let registration = Registration {
            factory: Box::new(move || Box::new(factory()) as Box<dyn EventData>),
            encode: Box::new(move |w, data| {
                let data = data
                    .as_any()
                    .downcast_ref::<D>()
                    .ok_or_else(|| CodecError::TypeMismatch {
                        name: enc_name.clone(),
                    })?;
                encode(w, data).map_err(|source| CodecError::Encode {
                    name: enc_name.clone(),
                    source,
                })
            }),
            decode: Box::new(move |r| {
                let data = decode(r).map_err(|source| CodecError::Decode {
                    name: dec_name.clone(),
                    source,
                })?;
                Ok(Box::new(data) as Box<dyn EventData>)
            }),
        };

        self.inner
            .write()
            .expect("codec registry lock poisoned")
            .insert(name, registration);
    }

    /// Register a payload type encoded as JSON via serde.
    pub fn register_json<D>(&self, name: impl Into<String>)
    where
        D: EventData + Serialize + DeserializeOwned + Default,
    {
        self.register(
            name,
            D::default,
            |w: &mut dyn Write, data: &D| {
                serde_json::to_writer(&mut *w, data).map_err(|e| Box::new(e) as BoxError)
            },
            |r: &mut dyn Read| {
                serde_json::from_reader(&mut *r).map_err(|e| Box::new(e) as BoxError)
            },
        );
    }

    /// Encode `data` under `name` into `w`.
    ///
    /// A payload exposing its own [`EventData::marshal`] is written as-is,
    /// bypassing the registered encoder; otherwise the registered encoder
    /// runs, and an unregistered name fails with
    /// [`CodecError::NotFound`].
    pub fn encode(&self, w: &mut dyn Write, name: &str, data: &dyn EventData) -> Result<(), CodecError> {
        if let Some(result) = data.marshal() {
            let bytes = result.map_err(|source| CodecError::Encode {
                name: name.to_string(),
                source,
            })?;
            return w.write_all(&bytes).map_err(|e| CodecError::Encode {
                name: name.to_string(),
                source: Box::new(e),
            });
        }

        let inner = self.inner.read().expect("codec registry lock poisoned");
        let registration = inner.get(name).ok_or_else(|| CodecError::NotFound {
            name: name.to_string(),
        })?;
        (registration.encode)(w, data)
    }

    /// Decode the payload registered under `name` from `r`.
    ///
    /// The factory's zero value is offered the bytes first through its
    /// [`EventData::unmarshal`] capability; if the value declines, the
    /// registered decoder runs over the same bytes.
    pub fn decode(&self, r: &mut dyn Read, name: &str) -> Result<Box<dyn EventData>, CodecError> {
        let inner = self.inner.read().expect("codec registry lock poisoned");
        let registration = inner.get(name).ok_or_else(|| CodecError::NotFound {
            name: name.to_string(),
        })?;

        let mut bytes = Vec::new();
        r.read_to_end(&mut bytes).map_err(|e| CodecError::Decode {
            name: name.to_string(),
            source: Box::new(e),
        })?;

        let mut value = (registration.factory)();
        match value.unmarshal(&bytes) {
            Some(Ok(())) => Ok(value),
            Some(Err(source)) => Err(CodecError::Decode {
                name: name.to_string(),
                source,
            }),
            None => (registration.decode)(&mut std::io::Cursor::new(bytes)),
        }
    }

    /// Construct the zero value of the payload registered under `name`.
    pub fn make(&self, name: &str) -> Result<Box<dyn EventData>, CodecError> {
        let inner = self.inner.read().expect("codec registry lock poisoned");
        let registration = inner.get(name).ok_or_else(|| CodecError::MissingFactory {
            name: name.to_string(),
        })?;
        Ok((registration.factory)())
    }

    /// Whether a codec is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("codec registry lock poisoned")
            .contains_key(name)
    }
}

/// The process-wide default registry.
///
/// Constructed empty on first use and lives for the rest of the process.
/// Prefer passing an explicit `&Registry`; reach for the default only when
/// no registry was provided.
pub fn default_registry() -> &'static Registry {
    static DEFAULT: OnceLock<Registry> = OnceLock::new();
    DEFAULT.get_or_init(Registry::new)
}
