//! Source Descriptor Table.
//!
//! One [`SourceDescriptor`] per supported library platform, mapping a URL
//! shape to a source identity, a resolution [`Strategy`], and the
//! [`Capabilities`] the download stage has to honour for that source.
//!
//! The table is built once and never mutated. Order matters: resolution is
//! first-match, so specific sources come before the generic IIIF fallback.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::resolver::utils::compile_static_regex;

/// How a source turns a user URL into a canonical manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Standard IIIF Presentation manifest (v2 or v3).
    Iiif,
    /// Bespoke scraping of HTML, XML, or a proprietary JSON API.
    PatternExtraction,
}

impl Strategy {
    /// Stable label for display output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iiif => "iiif",
            Self::PatternExtraction => "pattern",
        }
    }
}

/// Which page count wins when metadata disagrees with enumerated identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountPolicy {
    /// Enumerated identifiers are authoritative; metadata only fills in when
    /// enumeration finds nothing.
    #[default]
    PreferEnumerated,
    /// Metadata count is authoritative (template-driven sources whose listing
    /// markup is known to be truncated).
    PreferMetadata,
}

/// Response shape a source returns instead of content when the client is
/// outside the permitted region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoBlockSignature {
    /// HTTP statuses that can carry the block.
    pub statuses: &'static [u16],
    /// Case-insensitive body fragments; empty means the status alone is decisive.
    pub body_markers: &'static [&'static str],
}

impl GeoBlockSignature {
    /// Returns true when `status` and `body` together match this signature.
    #[must_use]
    pub fn matches(&self, status: u16, body: &str) -> bool {
        if !self.statuses.contains(&status) {
            return false;
        }
        if self.body_markers.is_empty() {
            return true;
        }
        let body = body.to_ascii_lowercase();
        self.body_markers
            .iter()
            .any(|marker| body.contains(&marker.to_ascii_lowercase()))
    }

    /// Whether a response body has to be read before deciding.
    #[must_use]
    pub fn needs_body(&self) -> bool {
        !self.body_markers.is_empty()
    }
}

/// Per-source behaviour flags consumed by resolvers and the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Known geo-restriction response, if the source has one.
    pub geo_block: Option<GeoBlockSignature>,
    /// Accept invalid or self-signed certificates.
    pub relaxed_tls: bool,
    /// Extra headers every request to this source must carry.
    pub custom_headers: &'static [(&'static str, &'static str)],
    /// Upper bound on simultaneous page fetches for one job.
    pub max_concurrency: Option<usize>,
    /// Page-count tie-break for pattern loaders.
    pub count_policy: CountPolicy,
}

/// Immutable description of one supported library.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    id: &'static str,
    name: &'static str,
    matcher: Regex,
    strategy: Strategy,
    capabilities: Capabilities,
    sample_urls: &'static [&'static str],
}

impl SourceDescriptor {
    /// Creates a descriptor with default capabilities.
    #[must_use]
    pub fn new(id: &'static str, name: &'static str, matcher: Regex, strategy: Strategy) -> Self {
        Self {
            id,
            name,
            matcher,
            strategy,
            capabilities: Capabilities::default(),
            sample_urls: &[],
        }
    }

    /// Replaces the capability flags.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets URLs this source must own; checked for shadowing at registration.
    #[must_use]
    pub fn with_sample_urls(mut self, sample_urls: &'static [&'static str]) -> Self {
        self.sample_urls = sample_urls;
        self
    }

    /// Stable identifier, persisted with jobs.
    #[must_use]
    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Library name for display.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolution strategy.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Capability flags.
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Sample URLs owned by this source.
    #[must_use]
    pub fn sample_urls(&self) -> &'static [&'static str] {
        self.sample_urls
    }

    /// URL pattern as written, for listings.
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.matcher.as_str()
    }

    /// Returns true if the URL has this source's shape.
    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        self.matcher.is_match(url.trim())
    }
}

/// Geo-restriction served by the National Library of Norway outside Norway.
pub const NORWEGIAN_GEO_BLOCK: GeoBlockSignature = GeoBlockSignature {
    statuses: &[403, 451],
    body_markers: &[],
};

static SOURCE_TABLE: LazyLock<Vec<Arc<SourceDescriptor>>> = LazyLock::new(build_source_table);

fn build_source_table() -> Vec<Arc<SourceDescriptor>> {
    vec![
        Arc::new(
            SourceDescriptor::new(
                "gallica",
                "Gallica (BnF)",
                compile_static_regex(r"(?i)^https?://gallica\.bnf\.fr/ark:/\d+/[a-z0-9]+"),
                Strategy::Iiif,
            )
            .with_capabilities(Capabilities {
                max_concurrency: Some(4),
                ..Capabilities::default()
            })
            .with_sample_urls(&["https://gallica.bnf.fr/ark:/12148/btv1b8449691v/f1.item"]),
        ),
        Arc::new(
            SourceDescriptor::new(
                "e-rara",
                "e-rara",
                compile_static_regex(r"(?i)^https?://(?:www\.)?e-rara\.ch/.*/titleinfo/\d+"),
                Strategy::Iiif,
            )
            .with_sample_urls(&["https://www.e-rara.ch/zuz/content/titleinfo/8325160"]),
        ),
        Arc::new(
            SourceDescriptor::new(
                "vatican",
                "Biblioteca Apostolica Vaticana",
                compile_static_regex(r"(?i)^https?://digi\.vatlib\.it/(?:view|mss/detail)/[^/?#]+"),
                Strategy::Iiif,
            )
            .with_sample_urls(&["https://digi.vatlib.it/view/MSS_Vat.lat.3225"]),
        ),
        Arc::new(
            SourceDescriptor::new(
                "norwegian",
                "National Library of Norway",
                compile_static_regex(r"(?i)^https?://(?:www\.)?nb\.no/items/[a-f0-9]+"),
                Strategy::Iiif,
            )
            .with_capabilities(Capabilities {
                geo_block: Some(NORWEGIAN_GEO_BLOCK),
                custom_headers: &[
                    ("Origin", "https://www.nb.no"),
                    ("Referer", "https://www.nb.no/"),
                ],
                max_concurrency: Some(3),
                ..Capabilities::default()
            })
            .with_sample_urls(&["https://www.nb.no/items/a7e1a2b2c7f3e1d8c6b2a1f0e9d8c7b6?page=0"]),
        ),
        Arc::new(
            SourceDescriptor::new(
                "bdl",
                "Biblioteca Digitale Lombarda",
                compile_static_regex(
                    r"(?i)^https?://(?:www\.)?bdl\.servizirl\.it/.*(?:BDL-OGGETTO-\d+|cdOggetto=\d+)",
                ),
                Strategy::PatternExtraction,
            )
            .with_capabilities(Capabilities {
                relaxed_tls: true,
                max_concurrency: Some(2),
                ..Capabilities::default()
            })
            .with_sample_urls(&[
                "https://www.bdl.servizirl.it/bdl/bookreader/index.html?path=fe&cdOggetto=3903",
                "https://www.bdl.servizirl.it/vufind/Record/BDL-OGGETTO-3903",
            ]),
        ),
        Arc::new(
            SourceDescriptor::new(
                "rome",
                "Biblioteca Nazionale Centrale di Roma",
                compile_static_regex(
                    r"(?i)^https?://digitale\.bnc\.roma\.sbn\.it/tecadigitale/(?:manoscrittoantico|libroantico)/[^/]+/[^/]+/\d+",
                ),
                Strategy::PatternExtraction,
            )
            .with_capabilities(Capabilities {
                relaxed_tls: true,
                max_concurrency: Some(3),
                ..Capabilities::default()
            })
            .with_sample_urls(&[
                "http://digitale.bnc.roma.sbn.it/tecadigitale/manoscrittoantico/BNCR_Ms_SESS_0062/BNCR_Ms_SESS_0062/1",
            ]),
        ),
        Arc::new(
            SourceDescriptor::new(
                "morgan",
                "The Morgan Library & Museum",
                compile_static_regex(r"(?i)^https?://(?:www\.)?themorgan\.org/collection/[^/?#]+"),
                Strategy::PatternExtraction,
            )
            .with_capabilities(Capabilities {
                max_concurrency: Some(2),
                ..Capabilities::default()
            })
            .with_sample_urls(&["https://www.themorgan.org/collection/lindau-gospels/thumbs"]),
        ),
        Arc::new(
            SourceDescriptor::new(
                "internet-culturale",
                "Internet Culturale",
                compile_static_regex(r"(?i)^https?://(?:www\.)?internetculturale\.it/.*[?&]id=[^&#]+"),
                Strategy::PatternExtraction,
            )
            .with_sample_urls(&[
                "https://www.internetculturale.it/jmms/iccuviewer/iccu.jsp?id=oai%3A193.206.197.121%3A18%3AVE0049%3ACSTOR.240.8290&mode=all&teca=marciana",
            ]),
        ),
        Arc::new(
            SourceDescriptor::new(
                "iiif",
                "Generic IIIF manifest",
                compile_static_regex(r"(?i)^https?://[^?#]+/manifest(?:\.json)?(?:\?[^#]*)?$"),
                Strategy::Iiif,
            )
            .with_sample_urls(&["https://iiif.example.org/iiif/book1/manifest.json"]),
        ),
    ]
}

/// Returns the full table in resolution order.
#[must_use]
pub fn source_table() -> &'static [Arc<SourceDescriptor>] {
    &SOURCE_TABLE
}

/// Looks up a descriptor by id.
#[must_use]
pub fn lookup(id: &str) -> Option<Arc<SourceDescriptor>> {
    SOURCE_TABLE.iter().find(|d| d.id() == id).cloned()
}
