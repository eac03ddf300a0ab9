//! # Release module
//!
//! This module provide the table of supported releases. A release pins the
//! tag of every image which is not versioned along with the application.

// -----------------------------------------------------------------------------
// Constants

pub const POSTGRES_IMAGE: &str = "registry.access.redhat.com/rhscl/postgresql-96-rhel7:1";

const SIDECARS_2019_4: &[(&str, &str)] = &[
    ("blackduck-cfssl", "1.0.0"),
    ("blackduck-logstash", "1.0.4"),
    ("blackduck-nginx", "1.0.7"),
    ("blackduck-solr", "1.0.0"),
    ("blackduck-zookeeper", "1.0.0"),
    ("blackduck-upload-cache", "1.0.8"),
    ("bdba-worker", "2019.03"),
    ("rabbitmq", "1.0.0"),
];

const SIDECARS_2019_6: &[(&str, &str)] = &[
    ("blackduck-cfssl", "1.0.0"),
    ("blackduck-logstash", "1.0.4"),
    ("blackduck-nginx", "1.0.8"),
    ("blackduck-solr", "1.0.0"),
    ("blackduck-zookeeper", "1.0.0"),
    ("blackduck-upload-cache", "1.0.9"),
    ("bdba-worker", "2019.06"),
    ("rabbitmq", "1.0.1"),
];

pub static RELEASES: &[Release] = &[
    Release::new("2019.4.0", SIDECARS_2019_4),
    Release::new("2019.4.1", SIDECARS_2019_4),
    Release::new("2019.4.2", SIDECARS_2019_4),
    Release::new("2019.4.3", SIDECARS_2019_4),
    Release::new("2019.6.0", SIDECARS_2019_6),
    Release::new("2019.6.1", SIDECARS_2019_6),
];

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    #[error("unsupported version '{0}', available options are {1}")]
    Version(String, String),
}

// -----------------------------------------------------------------------------
// Release structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Release {
    pub version: &'static str,
    sidecars: &'static [(&'static str, &'static str)],
}

impl Release {
    const fn new(version: &'static str, sidecars: &'static [(&'static str, &'static str)]) -> Self {
        Self { version, sidecars }
    }

    /// returns the release of the version, an empty version selects the
    /// latest one
    pub fn find(version: &str) -> Result<&'static Self, Error> {
        let version = version.trim();
        if version.is_empty() {
            if let Some(latest) = RELEASES.last() {
                return Ok(latest);
            }
        }

        RELEASES
            .iter()
            .find(|release| release.version == version)
            .ok_or_else(|| {
                Error::Version(
                    version.to_string(),
                    RELEASES
                        .iter()
                        .map(|release| format!("'{}'", release.version))
                        .collect::<Vec<_>>()
                        .join(", "),
                )
            })
    }

    /// returns the tag of the image in this release
    pub fn tag(&self, image: &str) -> &'static str {
        self.sidecars
            .iter()
            .find_map(|(name, tag)| (*name == image).then_some(*tag))
            .unwrap_or(self.version)
    }
}
