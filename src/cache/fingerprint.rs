//! Cache key construction.
//!
//! A fingerprint is the SHA-256 of every context component joined with `:`, in this
//! fixed order:
//!
//! 1. computation identity (owner, then function name)
//! 2. request path, unless a [`PathSentinel`] was declared
//! 3. tenant identifier, when the host is multi-tenant
//! 4. positional discriminators
//! 5. keyword discriminators as `name,value`, sorted by name
//! 6. extra components (literals, sentinels, evaluators run at build time)
//!
//! Changing this order changes every key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::FingerprintError;
use super::keys::{ENTRY_PREFIX, ObjectId};

const SEPARATOR: &str = ":";

/// A value that renders to the same string on every call.
pub trait KeyComponent {
    fn key_fragment(&self) -> Result<String, FingerprintError>;
}

impl<T: KeyComponent + ?Sized> KeyComponent for &T {
    fn key_fragment(&self) -> Result<String, FingerprintError> {
        (**self).key_fragment()
    }
}

impl KeyComponent for str {
    fn key_fragment(&self) -> Result<String, FingerprintError> {
        Ok(self.to_string())
    }
}

impl KeyComponent for String {
    fn key_fragment(&self) -> Result<String, FingerprintError> {
        Ok(self.clone())
    }
}

impl KeyComponent for bool {
    fn key_fragment(&self) -> Result<String, FingerprintError> {
        Ok(self.to_string())
    }
}

impl KeyComponent for Uuid {
    fn key_fragment(&self) -> Result<String, FingerprintError> {
        Ok(self.to_string())
    }
}

impl KeyComponent for ObjectId {
    fn key_fragment(&self) -> Result<String, FingerprintError> {
        Ok(self.to_string())
    }
}

macro_rules! integer_components {
    ($($ty:ty),*) => {
        $(
            impl KeyComponent for $ty {
                fn key_fragment(&self) -> Result<String, FingerprintError> {
                    Ok(self.to_string())
                }
            }
        )*
    };
}

integer_components!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

macro_rules! float_components {
    ($($ty:ty),*) => {
        $(
            impl KeyComponent for $ty {
                fn key_fragment(&self) -> Result<String, FingerprintError> {
                    if !self.is_finite() {
                        return Err(FingerprintError::malformed(
                            self.to_string(),
                            "non-finite floats have no canonical form",
                        ));
                    }
                    // -0.0 and 0.0 compare equal and must share a key.
                    if *self == 0.0 {
                        return Ok("0".to_string());
                    }
                    Ok(self.to_string())
                }
            }
        )*
    };
}

float_components!(f32, f64);

/// A declared stand-in for the request path.
///
/// Declaring any sentinel removes the implicit path component, so requests that differ
/// only in their path or query string share one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathSentinel {
    FullPath,
    Path,
    PathInfo,
}

impl PathSentinel {
    pub fn literal(self) -> &'static str {
        match self {
            Self::FullPath => "@full_path",
            Self::Path => "@path",
            Self::PathInfo => "@path_info",
        }
    }
}

type Evaluator = Arc<dyn Fn() -> Result<String, FingerprintError> + Send + Sync>;

#[derive(Clone)]
enum Extra {
    Literal(String),
    Sentinel(PathSentinel),
    Evaluated(Evaluator),
}

impl fmt::Debug for Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Sentinel(sentinel) => f.debug_tuple("Sentinel").field(sentinel).finish(),
            Self::Evaluated(_) => f.write_str("Evaluated(..)"),
        }
    }
}

/// Describes a cacheable computation and the discriminators that select its output.
///
/// Component errors are kept until [`Invocation::fingerprint`] so the builder chain
/// stays infallible; the first error wins.
#[derive(Debug, Clone)]
pub struct Invocation {
    owner: String,
    function: String,
    args: Vec<String>,
    kwargs: BTreeMap<String, String>,
    extras: Vec<Extra>,
    error: Option<FingerprintError>,
}

impl Invocation {
    pub fn new(owner: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            extras: Vec::new(),
            error: None,
        }
    }

    /// Add a positional discriminator.
    pub fn arg(mut self, value: impl KeyComponent) -> Self {
        if let Some(fragment) = self.capture(value.key_fragment()) {
            self.args.push(fragment);
        }
        self
    }

    /// Add a keyword discriminator. Names must not contain `,`.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl KeyComponent) -> Self {
        let name = name.into();
        if name.contains(',') {
            self.remember(FingerprintError::malformed(
                name,
                "keyword names must not contain `,`",
            ));
            return self;
        }
        if let Some(fragment) = self.capture(value.key_fragment()) {
            self.kwargs.insert(name, fragment);
        }
        self
    }

    /// Add a literal extra component.
    pub fn extra(mut self, value: impl KeyComponent) -> Self {
        if let Some(fragment) = self.capture(value.key_fragment()) {
            self.extras.push(Extra::Literal(fragment));
        }
        self
    }

    /// Add an extra component evaluated every time a fingerprint is built.
    pub fn extra_with<F, C>(mut self, evaluate: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: KeyComponent,
    {
        self.extras
            .push(Extra::Evaluated(Arc::new(move || evaluate().key_fragment())));
        self
    }

    /// Declare a path stand-in, suppressing the implicit path component.
    pub fn sentinel(mut self, sentinel: PathSentinel) -> Self {
        self.extras.push(Extra::Sentinel(sentinel));
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    fn suppresses_path(&self) -> bool {
        self.extras
            .iter()
            .any(|extra| matches!(extra, Extra::Sentinel(_)))
    }

    fn capture(&mut self, fragment: Result<String, FingerprintError>) -> Option<String> {
        match fragment {
            Ok(fragment) => Some(fragment),
            Err(err) => {
                self.remember(err);
                None
            }
        }
    }

    fn remember(&mut self, err: FingerprintError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Render the ordered context components for one request.
    pub fn components(
        &self,
        path: &str,
        tenant: Option<&str>,
    ) -> Result<Vec<String>, FingerprintError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        let mut components = vec![self.owner.clone(), self.function.clone()];
        if !self.suppresses_path() {
            components.push(path.to_string());
        }
        if let Some(tenant) = tenant {
            components.push(tenant.to_string());
        }
        components.extend(self.args.iter().cloned());
        components.extend(
            self.kwargs
                .iter()
                .map(|(name, value)| format!("{name},{value}")),
        );
        for extra in &self.extras {
            let fragment = match extra {
                Extra::Literal(value) => value.clone(),
                Extra::Sentinel(sentinel) => sentinel.literal().to_string(),
                Extra::Evaluated(evaluate) => evaluate()?,
            };
            components.push(fragment);
        }
        Ok(components)
    }

    /// Build the cache entry key for one request.
    pub fn fingerprint(&self, path: &str, tenant: Option<&str>) -> Result<String, FingerprintError> {
        let components = self.components(path, tenant)?;
        Ok(fingerprint(&components))
    }
}

/// Hash already-rendered components into a cache entry key.
pub fn fingerprint<S: AsRef<str>>(components: &[S]) -> String {
    let mut hasher = Sha256::new();
    for (index, component) in components.iter().enumerate() {
        if index > 0 {
            hasher.update(SEPARATOR.as_bytes());
        }
        hasher.update(component.as_ref().as_bytes());
    }
    format!("{ENTRY_PREFIX}{}", hex::encode(hasher.finalize()))
}
