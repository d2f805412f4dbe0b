use std::fmt;

/// One step of a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    Key(String),
}

/// Location of a value inside a message, rendered as `left.left.value`,
/// `labels["k"]` or `items[2]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub(crate) fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub(crate) fn pop(&mut self) {
        self.0.pop();
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }

        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) if i == 0 => f.write_str(name)?,
                PathSegment::Field(name) => write!(f, ".{name}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
                PathSegment::Key(key) => write!(f, "[\"{key}\"]")?,
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed request text at line {line}, column {column}: '{message}'")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Invalid value for '{path}': {message}")]
    Type { path: FieldPath, message: String },

    #[error("Value out of range for '{path}': {message}")]
    Range { path: FieldPath, message: String },
}

impl CodecError {
    /// The field path the error refers to, `None` for parse errors.
    pub fn path(&self) -> Option<&FieldPath> {
        match self {
            CodecError::Parse { .. } => None,
            CodecError::Type { path, .. } | CodecError::Range { path, .. } => Some(path),
        }
    }

    pub(crate) fn parse(err: &serde_json::Error) -> Self {
        CodecError::Parse {
            line: err.line(),
            column: err.column(),
            message: err.to_string(),
        }
    }
}
