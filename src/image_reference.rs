use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";
const LEGACY_DEFAULT_REGISTRY: &str = "index.docker.io";
const OFFICIAL_REPOSITORY_PREFIX: &str = "library/";
const MAX_NAME_LENGTH: usize = 255;

// [domain[:port]/]path[/path...][:tag][@algorithm:hex]
static REFERENCE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    let domain_component = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
    let domain = format!(r"{domain_component}(?:\.{domain_component})*(?::[0-9]+)?");
    let path_component = r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*";
    let name = format!(r"(?:{domain}/)?{path_component}(?:/{path_component})*");
    let tag = r"[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}";
    let digest = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";
    Regex::new(&format!(r"^({name})(?::({tag}))?(?:@({digest}))?$")).ok()
});

static IDENTIFIER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").ok());

/// A normalized container image reference.
///
/// `registry` is always an absolute host, `docker.io` when the image string
/// names none. Official Docker Hub images get the `library/` repository prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Explicit tag, or `latest` when the image has neither a tag nor a digest.
    pub tag: Option<String>,
    pub digest: Option<String>,
    /// True when `tag` was filled in by normalization rather than written in the image.
    pub implicit_tag: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    InvalidFormat(String),
    UppercaseRepository(String),
    NameTooLong(String),
    DigestOnlyName(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
            ParseError::UppercaseRepository(image) => {
                write!(f, "repository name must be lowercase: {}", image)
            }
            ParseError::NameTooLong(image) => write!(
                f,
                "repository name must not be longer than {} characters: {}",
                MAX_NAME_LENGTH, image
            ),
            ParseError::DigestOnlyName(image) => write!(
                f,
                "repository name cannot be a 64-byte hexadecimal string: {}",
                image
            ),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if IDENTIFIER_RE.as_ref().is_some_and(|re| re.is_match(s)) {
            return Err(ParseError::DigestOnlyName(s.to_string()));
        }

        let (registry, remainder) = split_registry(s);

        // Only the repository part has to be lowercase, tags may contain uppercase letters
        let repository_part = remainder.split(':').next().unwrap_or_default();
        if repository_part.to_lowercase() != repository_part {
            return Err(ParseError::UppercaseRepository(s.to_string()));
        }

        let normalized = format!("{}/{}", registry, remainder);
        let captures = REFERENCE_RE
            .as_ref()
            .and_then(|re| re.captures(&normalized))
            .ok_or_else(|| ParseError::InvalidFormat(s.to_string()))?;

        let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        if name.len() > MAX_NAME_LENGTH {
            return Err(ParseError::NameTooLong(s.to_string()));
        }
        let repository = name
            .strip_prefix(registry.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|repository| !repository.is_empty())
            .ok_or_else(|| ParseError::InvalidFormat(s.to_string()))?;

        let tag = captures.get(2).map(|m| m.as_str().to_string());
        let digest = captures.get(3).map(|m| m.as_str().to_string());
        let implicit_tag = tag.is_none() && digest.is_none();

        Ok(Self {
            repository: repository.to_string(),
            registry,
            tag: if implicit_tag {
                Some(DEFAULT_TAG.to_string())
            } else {
                tag
            },
            digest,
            implicit_tag,
        })
    }

    /// A reference floats on `latest` unless it is pinned to a digest.
    pub fn uses_latest_tag(&self) -> bool {
        self.digest.is_none() && self.tag.as_deref() == Some(DEFAULT_TAG)
    }
}

/// Splits the registry host off an image string.
///
/// The first path segment is a registry only if it looks like a host: it
/// contains a `.` or a `:` or it is `localhost`.
fn split_registry(s: &str) -> (String, String) {
    let (registry, remainder) = match s.split_once('/') {
        Some((first, rest)) if first.contains(['.', ':']) || first == "localhost" => {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), s.to_string()),
    };

    let registry = if registry == LEGACY_DEFAULT_REGISTRY {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry
    };

    if registry == DEFAULT_REGISTRY && !remainder.contains('/') {
        (registry, format!("{}{}", OFFICIAL_REPOSITORY_PREFIX, remainder))
    } else {
        (registry, remainder)
    }
}
