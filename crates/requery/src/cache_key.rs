use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// Separator used when rendering a [`CacheKey`] as a single flat string.
///
/// The rendered form is used for logs and diagnostics only; storage and
/// matching always operate on the segment sequence, so a segment containing
/// the separator cannot be confused with two segments. Segments should still
/// avoid it so the rendered form stays unambiguous.
pub const KEY_SEPARATOR: &str = "__";

/// Separator between rendered `field:value` pairs inside a synthetic
/// parameter segment.
const FRAGMENT_SEPARATOR: &str = "|";

/// An ordered sequence of segments identifying one cache entry.
///
/// Keys compare and hash by their segment sequence. Two parameters with the
/// same fields and values always resolve to the same key, regardless of field
/// order, and distinct segment sequences never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    segments: Arc<[String]>,
}

impl CacheKey {
    /// Creates a key from a sequence of segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CacheKey {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the decoded segment sequence.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns whether this key is covered by `prefix`.
    ///
    /// Matching is segment-wise: `["a"]` covers `["a"]` and `["a", "b"]`, but
    /// never `["ab"]`. With `exact`, only the identical segment sequence
    /// matches.
    pub fn matches_prefix<S: AsRef<str>>(&self, prefix: &[S], exact: bool) -> bool {
        if exact && prefix.len() != self.segments.len() {
            return false;
        }
        prefix.len() <= self.segments.len()
            && prefix
                .iter()
                .zip(self.segments.iter())
                .all(|(p, s)| p.as_ref() == s)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join(KEY_SEPARATOR))
    }
}

/// How a query derives its [`CacheKey`] from a parameter.
pub enum KeySpec<P> {
    /// A fixed base key. A present parameter contributes one synthetic
    /// trailing segment derived from its serialized fields.
    Static(Vec<String>),
    /// A caller-supplied function whose result is used verbatim. The caller
    /// owns uniqueness in this case.
    Fn(Arc<dyn Fn(&P) -> Vec<String> + Send + Sync>),
}

impl<P> Clone for KeySpec<P> {
    fn clone(&self) -> Self {
        match self {
            KeySpec::Static(base) => KeySpec::Static(base.clone()),
            KeySpec::Fn(f) => KeySpec::Fn(Arc::clone(f)),
        }
    }
}

impl<P> fmt::Debug for KeySpec<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Static(base) => f.debug_tuple("Static").field(base).finish(),
            KeySpec::Fn(_) => f.debug_tuple("Fn").finish(),
        }
    }
}

impl<P> KeySpec<P> {
    /// Creates a key spec from a key-derivation function.
    pub fn from_fn(f: impl Fn(&P) -> Vec<String> + Send + Sync + 'static) -> Self {
        KeySpec::Fn(Arc::new(f))
    }

    /// Resolves the spec and a parameter into a concrete [`CacheKey`].
    ///
    /// A parameter that serializes to `null` (the unit type being the
    /// canonical no-parameter marker) leaves a static base key unchanged.
    /// Struct and map parameters render their fields as `field:value` pairs,
    /// sorted lexicographically, so structurally equal parameters resolve to
    /// the same key. Scalar parameters render as their plain string form.
    pub fn resolve(&self, param: &P) -> CacheKey
    where
        P: Serialize,
    {
        match self {
            KeySpec::Fn(f) => CacheKey::new(f(param)),
            KeySpec::Static(base) => {
                let mut segments = base.clone();
                if let Some(fragment) = param_fragment(param) {
                    segments.push(fragment);
                }
                CacheKey::new(segments)
            }
        }
    }
}

impl<P, S: Into<String>, const N: usize> From<[S; N]> for KeySpec<P> {
    fn from(base: [S; N]) -> Self {
        KeySpec::Static(base.into_iter().map(Into::into).collect())
    }
}

impl<P> From<Vec<String>> for KeySpec<P> {
    fn from(base: Vec<String>) -> Self {
        KeySpec::Static(base)
    }
}

impl<P> From<&[&str]> for KeySpec<P> {
    fn from(base: &[&str]) -> Self {
        KeySpec::Static(base.iter().map(|s| (*s).to_owned()).collect())
    }
}

/// Renders the synthetic key segment for a parameter, or `None` when the
/// parameter is absent.
fn param_fragment<P: Serialize>(param: &P) -> Option<String> {
    let value = match serde_json::to_value(param) {
        Ok(value) => value,
        Err(error) => {
            let dynerr: &dyn std::error::Error = &error;
            tracing::error!(error = dynerr, "failed to serialize query parameter");
            return None;
        }
    };

    match value {
        Value::Null => None,
        Value::Object(fields) => {
            let mut pairs: Vec<String> = fields
                .iter()
                .map(|(field, value)| format!("{field}:{}", render_value(value)))
                .collect();
            pairs.sort();
            Some(pairs.join(FRAGMENT_SEPARATOR))
        }
        scalar => Some(render_value(&scalar)),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
