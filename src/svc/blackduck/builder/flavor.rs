//! # Flavor module
//!
//! This module provide the sizing table of an instance. A flavor sets the
//! replicas and resources of the components whose footprint depends on the
//! declared size, the other components share fixed resources.

use std::str::FromStr;

// -----------------------------------------------------------------------------
// Constants

pub const CFSSL_MEMORY: &str = "640M";
pub const LOGSTASH_MEMORY: &str = "1G";
pub const REGISTRATION_MEMORY: &str = "640M";
pub const ZOOKEEPER_MEMORY: &str = "640M";
pub const AUTHENTICATION_MEMORY: &str = "1024M";
pub const AUTHENTICATION_HEAP: &str = "512m";
pub const DOCUMENTATION_MEMORY: &str = "512M";
pub const BINARY_SCANNER_MEMORY: &str = "2048M";
pub const RABBITMQ_MEMORY: &str = "1024M";
pub const UPLOAD_CACHE_MEMORY: &str = "512M";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    #[error("unsupported size '{0}', available options are 'small', 'medium', 'large' or 'x-large'")]
    Size(String),
}

// -----------------------------------------------------------------------------
// Size enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Size {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl FromStr for Size {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "x-large" | "xlarge" => Ok(Self::ExtraLarge),
            _ => Err(Error::Size(s.to_string())),
        }
    }
}

// -----------------------------------------------------------------------------
// Flavor structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Flavor {
    pub size: Size,
    pub webserver_memory: &'static str,
    pub solr_memory: &'static str,
    pub webapp_cpu: &'static str,
    pub webapp_memory: &'static str,
    pub webapp_heap: &'static str,
    pub scan_replicas: i32,
    pub scan_memory: &'static str,
    pub scan_heap: &'static str,
    pub jobrunner_replicas: i32,
    pub jobrunner_memory: &'static str,
    pub jobrunner_heap: &'static str,
    pub postgres_cpu: &'static str,
    pub postgres_memory: &'static str,
}

pub static SMALL: Flavor = Flavor {
    size: Size::Small,
    webserver_memory: "512M",
    solr_memory: "640M",
    webapp_cpu: "1",
    webapp_memory: "2560M",
    webapp_heap: "2048m",
    scan_replicas: 1,
    scan_memory: "2560M",
    scan_heap: "2048m",
    jobrunner_replicas: 1,
    jobrunner_memory: "4608M",
    jobrunner_heap: "4096m",
    postgres_cpu: "1",
    postgres_memory: "3072M",
};

pub static MEDIUM: Flavor = Flavor {
    size: Size::Medium,
    webserver_memory: "2048M",
    solr_memory: "1024M",
    webapp_cpu: "2",
    webapp_memory: "5120M",
    webapp_heap: "4096m",
    scan_replicas: 2,
    scan_memory: "5120M",
    scan_heap: "4096m",
    jobrunner_replicas: 4,
    jobrunner_memory: "7168M",
    jobrunner_heap: "6144m",
    postgres_cpu: "2",
    postgres_memory: "8192M",
};

pub static LARGE: Flavor = Flavor {
    size: Size::Large,
    webserver_memory: "2048M",
    solr_memory: "1024M",
    webapp_cpu: "2",
    webapp_memory: "9728M",
    webapp_heap: "8192m",
    scan_replicas: 3,
    scan_memory: "9728M",
    scan_heap: "8192m",
    jobrunner_replicas: 6,
    jobrunner_memory: "13824M",
    jobrunner_heap: "12288m",
    postgres_cpu: "2",
    postgres_memory: "12288M",
};

pub static EXTRA_LARGE: Flavor = Flavor {
    size: Size::ExtraLarge,
    webserver_memory: "2048M",
    solr_memory: "1024M",
    webapp_cpu: "3",
    webapp_memory: "19728M",
    webapp_heap: "8192m",
    scan_replicas: 5,
    scan_memory: "9728M",
    scan_heap: "8192m",
    jobrunner_replicas: 10,
    jobrunner_memory: "13824M",
    jobrunner_heap: "12288m",
    postgres_cpu: "3",
    postgres_memory: "12288M",
};

impl Flavor {
    /// returns the flavor of the declared size
    pub fn parse(size: &str) -> Result<&'static Self, Error> {
        Ok(Self::of(size.parse()?))
    }

    pub fn of(size: Size) -> &'static Self {
        match size {
            Size::Small => &SMALL,
            Size::Medium => &MEDIUM,
            Size::Large => &LARGE,
            Size::ExtraLarge => &EXTRA_LARGE,
        }
    }
}
