use crate::converter::StateConversionError;
use crate::placeholder::{PlaceholderBounds, PlaceholderValues, TemplatePlaceholder};

/// One key template, or an ordered tuple of them.
///
/// The tuple order is load-bearing: it is the order sources are concatenated
/// in and destinations receive their chunks in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTemplates {
    Single(String),
    Tuple(Vec<String>),
}

impl KeyTemplates {
    fn is_empty(&self) -> bool {
        matches!(self, KeyTemplates::Tuple(templates) if templates.is_empty())
    }

    fn contains(&self, token: &str) -> bool {
        match self {
            KeyTemplates::Single(template) => template.contains(token),
            KeyTemplates::Tuple(templates) => templates.iter().any(|t| t.contains(token)),
        }
    }
}

impl From<&str> for KeyTemplates {
    fn from(template: &str) -> Self {
        KeyTemplates::Single(template.to_string())
    }
}

impl From<String> for KeyTemplates {
    fn from(template: String) -> Self {
        KeyTemplates::Single(template)
    }
}

impl From<Vec<&str>> for KeyTemplates {
    fn from(templates: Vec<&str>) -> Self {
        KeyTemplates::Tuple(templates.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for KeyTemplates {
    fn from(templates: [&str; N]) -> Self {
        KeyTemplates::Tuple(templates.iter().map(|t| t.to_string()).collect())
    }
}

/// One component of an unflatten shape: a literal size, or a placeholder that
/// resolves to its bound (e.g. `Expert` resolves to the number of experts).
/// `-1` is passed through to the tensor substrate to infer the size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnflattenDim {
    Literal(i64),
    Placeholder(TemplatePlaceholder),
}

impl From<i64> for UnflattenDim {
    fn from(size: i64) -> Self {
        UnflattenDim::Literal(size)
    }
}

impl From<TemplatePlaceholder> for UnflattenDim {
    fn from(placeholder: TemplatePlaceholder) -> Self {
        UnflattenDim::Placeholder(placeholder)
    }
}

/// The template for a mapping of state from one checkpoint layout to another
/// (e.g. framework-native to model-hub). Templates are "templates" because
/// keys and shape metadata may carry placeholders for information like the
/// block index or the number of MoE experts; [`StateMappingTemplate::to_mapping`]
/// turns one into a concrete [`StateMapping`] once that information is known.
///
/// The simplest mapping is one-to-one: a single string for both
/// `source_keys` and `dest_keys`. Many-to-many mappings and geometric
/// manipulations (unflatten, permute, flatten, chunk) are layered on top.
/// The transform pipeline order is fixed: concatenate sources, unflatten,
/// permute, flatten, chunk into destinations. Reordering changes semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMappingTemplate {
    /// The key or keys of the state being mapped from.
    pub source_keys: KeyTemplates,
    /// The key or keys of the state being mapped to.
    pub dest_keys: KeyTemplates,
    /// A placeholder in `source_keys` for which this mapping should consume
    /// all valid values rather than one specific value, e.g. reading the
    /// weights of every expert into a single fused state. Requires
    /// `source_keys` to be a single template.
    pub source_key_per_placeholder: Option<TemplatePlaceholder>,
    /// The destination-side counterpart of `source_key_per_placeholder`:
    /// a single logical state fans out into one key per placeholder value.
    pub dest_key_per_placeholder: Option<TemplatePlaceholder>,
    /// Dimension along which multiple source states are concatenated.
    pub source_concat_dim: i64,
    /// Unflatten the given dimension into the given shape. A placeholder in
    /// the shape stands for its bound (e.g. `Expert` for the expert count).
    pub unflatten_dim: Option<(i64, Vec<UnflattenDim>)>,
    /// Dimension permutation applied after any unflattening.
    pub dims_permutation: Option<Vec<i64>>,
    /// Inclusive dimension range flattened after any permutation.
    pub flatten_dims: Option<(i64, i64)>,
    /// Dimension along which the transformed state is evenly chunked across
    /// the destination keys.
    pub dest_chunk_dim: i64,
}

impl StateMappingTemplate {
    pub fn new(source_keys: impl Into<KeyTemplates>, dest_keys: impl Into<KeyTemplates>) -> Self {
        Self {
            source_keys: source_keys.into(),
            dest_keys: dest_keys.into(),
            source_key_per_placeholder: None,
            dest_key_per_placeholder: None,
            source_concat_dim: 0,
            unflatten_dim: None,
            dims_permutation: None,
            flatten_dims: None,
            dest_chunk_dim: 0,
        }
    }

    pub fn source_key_per_placeholder(mut self, placeholder: TemplatePlaceholder) -> Self {
        self.source_key_per_placeholder = Some(placeholder);
        self
    }

    pub fn dest_key_per_placeholder(mut self, placeholder: TemplatePlaceholder) -> Self {
        self.dest_key_per_placeholder = Some(placeholder);
        self
    }

    pub fn source_concat_dim(mut self, dim: i64) -> Self {
        self.source_concat_dim = dim;
        self
    }

    pub fn unflatten(mut self, dim: i64, shape: Vec<UnflattenDim>) -> Self {
        self.unflatten_dim = Some((dim, shape));
        self
    }

    pub fn permute(mut self, dims: Vec<i64>) -> Self {
        self.dims_permutation = Some(dims);
        self
    }

    pub fn flatten(mut self, start_dim: i64, end_dim: i64) -> Self {
        self.flatten_dims = Some((start_dim, end_dim));
        self
    }

    pub fn dest_chunk_dim(mut self, dim: i64) -> Self {
        self.dest_chunk_dim = dim;
        self
    }

    /// Checks the construction-time invariants. Called by
    /// [`crate::StateConverter::new`] so that a malformed template surfaces
    /// immediately, not at conversion time.
    pub fn validate(&self) -> Result<(), StateConversionError> {
        if self.source_keys.is_empty() || self.dest_keys.is_empty() {
            return Err(StateConversionError::EmptyKeyTemplates);
        }
        if let Some(placeholder) = self.source_key_per_placeholder {
            if matches!(self.source_keys, KeyTemplates::Tuple(_)) {
                return Err(StateConversionError::PerPlaceholderWithMultipleKeys { placeholder });
            }
            if !self.source_keys.contains(placeholder.token()) {
                return Err(StateConversionError::PerPlaceholderMissingFromTemplate {
                    placeholder,
                });
            }
        }
        if let Some(placeholder) = self.dest_key_per_placeholder {
            if matches!(self.dest_keys, KeyTemplates::Tuple(_)) {
                return Err(StateConversionError::PerPlaceholderWithMultipleKeys { placeholder });
            }
            if !self.dest_keys.contains(placeholder.token()) {
                return Err(StateConversionError::PerPlaceholderMissingFromTemplate {
                    placeholder,
                });
            }
        }
        Ok(())
    }

    fn templates_to_keys(
        templates: &KeyTemplates,
        placeholder_values: &PlaceholderValues,
        key_per_placeholder: Option<(TemplatePlaceholder, usize)>,
    ) -> Option<Vec<String>> {
        let expanded: Vec<String> = match (templates, key_per_placeholder) {
            (KeyTemplates::Single(template), Some((placeholder, bound))) => (0..bound)
                .map(|value| template.replace(placeholder.token(), &value.to_string()))
                .collect(),
            // Validated at converter construction; per-placeholder expansion
            // never applies to a multi-key side.
            (KeyTemplates::Tuple(_), Some(_)) => return None,
            (KeyTemplates::Single(template), None) => vec![template.clone()],
            (KeyTemplates::Tuple(templates), None) => templates.clone(),
        };

        let mut keys = Vec::with_capacity(expanded.len());
        for template in &expanded {
            let mut key = template.clone();
            for (placeholder, value) in placeholder_values {
                match (template.contains(placeholder.token()), value) {
                    (true, Some(value)) => {
                        key = key.replace(placeholder.token(), &value.to_string());
                    }
                    (false, None) => {}
                    // A placeholder with a value but absent from the template,
                    // or present in the template but without a value, makes
                    // this combination of placeholder values invalid.
                    _ => return None,
                }
            }
            keys.push(key);
        }

        Some(keys)
    }

    /// Resolves this template against a concrete assignment of placeholder
    /// values, producing a [`StateMapping`], or `None` if the template does
    /// not apply to this assignment (missing bounds, or a symmetric mismatch
    /// between assigned values and the placeholders the templates mention).
    ///
    /// In an assignment, `None` is the expansion sentinel: a side declaring
    /// per-placeholder keys only resolves when its placeholder is unset, and
    /// then materializes one key per value in `0..bound`, ascending.
    pub fn to_mapping(
        &self,
        placeholder_values: &PlaceholderValues,
        placeholder_bounds: &PlaceholderBounds,
    ) -> Option<StateMapping> {
        let mut required_placeholders = Vec::new();
        required_placeholders.extend(self.source_key_per_placeholder);
        required_placeholders.extend(self.dest_key_per_placeholder);
        if let Some((_, shape)) = &self.unflatten_dim {
            required_placeholders.extend(shape.iter().filter_map(|dim| match dim {
                UnflattenDim::Placeholder(placeholder) => Some(*placeholder),
                UnflattenDim::Literal(_) => None,
            }));
        }
        if required_placeholders
            .iter()
            .any(|placeholder| !placeholder_bounds.contains_key(placeholder))
        {
            return None;
        }

        let expansion = |key_per_placeholder: Option<TemplatePlaceholder>| match key_per_placeholder
        {
            Some(placeholder) => match placeholder_values.get(&placeholder) {
                // Expansion only fires on the assignment where the
                // placeholder is unset; concrete values are handled by other
                // assignments in the enumeration.
                Some(None) => Some(Some((placeholder, placeholder_bounds[&placeholder]))),
                _ => None,
            },
            None => Some(None),
        };

        let source_keys = Self::templates_to_keys(
            &self.source_keys,
            placeholder_values,
            expansion(self.source_key_per_placeholder)?,
        )?;
        let dest_keys = Self::templates_to_keys(
            &self.dest_keys,
            placeholder_values,
            expansion(self.dest_key_per_placeholder)?,
        )?;

        let unflatten_dim = self.unflatten_dim.as_ref().map(|(dim, shape)| {
            let resolved = shape
                .iter()
                .map(|entry| match entry {
                    UnflattenDim::Literal(size) => *size,
                    UnflattenDim::Placeholder(placeholder) => {
                        placeholder_bounds[placeholder] as i64
                    }
                })
                .collect();
            (*dim, resolved)
        });

        Some(StateMapping {
            source_keys,
            dest_keys,
            source_concat_dim: self.source_concat_dim,
            unflatten_dim,
            dims_permutation: self.dims_permutation.clone(),
            flatten_dims: self.flatten_dims,
            dest_chunk_dim: self.dest_chunk_dim,
        })
    }
}

/// A concrete mapping of state from one checkpoint layout to another: every
/// placeholder resolved to a literal value, keys materialized as ordered
/// tuples. Produced by [`StateMappingTemplate::to_mapping`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMapping {
    pub source_keys: Vec<String>,
    pub dest_keys: Vec<String>,
    pub source_concat_dim: i64,
    pub unflatten_dim: Option<(i64, Vec<i64>)>,
    pub dims_permutation: Option<Vec<i64>>,
    pub flatten_dims: Option<(i64, i64)>,
    pub dest_chunk_dim: i64,
}
