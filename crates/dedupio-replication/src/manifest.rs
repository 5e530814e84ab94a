//! Commit manifest returned by a successful import

use crate::error::{ImportError, ImportResult};
use serde::{Deserialize, Serialize};

/// What was imported, from where, and into which volume
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportManifest {
    pub src: String,
    pub dest: String,
    pub srcserver: String,
    pub srcserverport: u16,
    pub batchsize: usize,
    pub filesimported: u64,
    pub bytesimported: u64,
    pub entriesimported: u64,
    pub virtualbytesimported: u64,
    /// Epoch millis
    pub starttime: i64,
    /// Epoch millis
    pub endtime: i64,
    pub volume: String,
    pub volumeconfig: String,
}

/// Attribute-only rendering of [`ImportManifest`]
#[derive(Serialize)]
#[serde(rename = "replication-import")]
struct ManifestXml<'a> {
    #[serde(rename = "@src")]
    src: &'a str,
    #[serde(rename = "@dest")]
    dest: &'a str,
    #[serde(rename = "@srcserver")]
    srcserver: &'a str,
    #[serde(rename = "@srcserverport")]
    srcserverport: u16,
    #[serde(rename = "@batchsize")]
    batchsize: usize,
    #[serde(rename = "@filesimported")]
    filesimported: u64,
    #[serde(rename = "@bytesimported")]
    bytesimported: u64,
    #[serde(rename = "@entriesimported")]
    entriesimported: u64,
    #[serde(rename = "@virtualbytesimported")]
    virtualbytesimported: u64,
    #[serde(rename = "@starttime")]
    starttime: i64,
    #[serde(rename = "@endtime")]
    endtime: i64,
    #[serde(rename = "@volume")]
    volume: &'a str,
    #[serde(rename = "@volumeconfig")]
    volumeconfig: &'a str,
}

impl ImportManifest {
    /// `<replication-import .../>` with one attribute per field
    pub fn to_xml(&self) -> ImportResult<String> {
        let doc = ManifestXml {
            src: &self.src,
            dest: &self.dest,
            srcserver: &self.srcserver,
            srcserverport: self.srcserverport,
            batchsize: self.batchsize,
            filesimported: self.filesimported,
            bytesimported: self.bytesimported,
            entriesimported: self.entriesimported,
            virtualbytesimported: self.virtualbytesimported,
            starttime: self.starttime,
            endtime: self.endtime,
            volume: &self.volume,
            volumeconfig: &self.volumeconfig,
        };
        quick_xml::se::to_string(&doc).map_err(|e| ImportError::Manifest(e.to_string()))
    }

    pub fn to_json(&self) -> ImportResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ImportError::Manifest(e.to_string()))
    }
}
