use std::{collections::HashMap, error::Error, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser, value::Value};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use wire::piece::Piece;

/// Decoded .torrent file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce: Option<String>,
    #[serde(rename = "announce-list", skip_serializing_if = "Option::is_none")]
    pub announce_list: Option<Vec<Vec<String>>>,
    #[serde(rename = "creation date", skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "created by", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Info {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub pieces: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileEntry {
    pub length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
    pub path: Vec<String>,
}

impl Metainfo {
    pub fn deserialize(data: &[u8]) -> Result<Metainfo, MetainfoError> {
        Ok(de::from_bytes::<Metainfo>(data)?)
    }

    /// SHA-1 of the raw bencoded `info` value. The dictionary is re-encoded
    /// from the parsed value; bencode sorts dictionary keys canonically, so
    /// the re-encoding reproduces the original bytes.
    pub fn compute_info_hash(data: &[u8]) -> Result<[u8; 20], MetainfoError> {
        let value = de::from_bytes::<Value>(data)?;
        let info = match &value {
            Value::Dict(entries) => entries
                .get("info".as_bytes())
                .ok_or(MetainfoError::MissingInfoDict)?,
            _ => return Err(MetainfoError::MissingInfoDict),
        };
        let raw_info = ser::to_bytes(info)?;

        let mut hasher = Sha1::new();
        hasher.update(&raw_info);
        Ok(hasher.finalize().into())
    }

    /// Total payload size across all files.
    pub fn total_length(&self) -> Result<u64, MetainfoError> {
        if let Some(length) = self.info.length {
            return Ok(length);
        }
        if let Some(files) = &self.info.files {
            return Ok(files.iter().map(|f| f.length).sum());
        }
        Err(MetainfoError::MissingLength)
    }

    /// Builds the piece table: every piece is `piece length` bytes except
    /// the last, and carries its 20-byte hash from the `pieces` string.
    pub fn parse_pieces(&self) -> Result<HashMap<u32, Piece>, MetainfoError> {
        let total_length = self.total_length()?;
        let piece_length = self.info.piece_length;
        if piece_length == 0 || self.info.pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieces);
        }
        let piece_count = total_length.div_ceil(piece_length);
        if piece_count != (self.info.pieces.len() / 20) as u64 {
            return Err(MetainfoError::InvalidPieces);
        }

        let mut pieces = HashMap::with_capacity(piece_count as usize);
        for (index, chunk) in self.info.pieces.chunks_exact(20).enumerate() {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            let length = (total_length - index as u64 * piece_length).min(piece_length) as u32;
            pieces.insert(index as u32, Piece::new(index as u32, length, hash));
        }
        Ok(pieces)
    }

    /// File paths (relative to the download directory) with their lengths,
    /// in torrent order. Single-file torrents yield one entry named after
    /// the torrent; multi-file torrents nest under a directory of that name.
    pub fn file_layout(&self) -> Result<Vec<(PathBuf, u64)>, MetainfoError> {
        if let Some(files) = &self.info.files {
            let mut layout = Vec::with_capacity(files.len());
            for file in files {
                let mut path = PathBuf::from(&self.info.name);
                for component in &file.path {
                    if component.is_empty() || component == ".." {
                        return Err(MetainfoError::InvalidPath(file.path.join("/")));
                    }
                    path.push(component);
                }
                layout.push((path, file.length));
            }
            return Ok(layout);
        }
        match self.info.length {
            Some(length) => Ok(vec![(PathBuf::from(&self.info.name), length)]),
            None => Err(MetainfoError::MissingLength),
        }
    }

    /// Announce URLs in tier order, deduplicated, with the plain `announce`
    /// key as fallback when no list is present.
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        if let Some(announce) = &self.announce {
            if !urls.contains(announce) {
                urls.push(announce.clone());
            }
        }
        urls
    }
}

#[derive(Debug)]
pub enum MetainfoError {
    Decode(serde_bencode::Error),
    MissingInfoDict,
    MissingLength,
    InvalidPieces,
    InvalidPath(String),
}

impl fmt::Display for MetainfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetainfoError::Decode(err) => write!(f, "Failed to decode metainfo: {}", err),
            MetainfoError::MissingInfoDict => write!(f, "Metainfo has no info dictionary"),
            MetainfoError::MissingLength => {
                write!(f, "Metainfo declares neither a length nor a file list")
            }
            MetainfoError::InvalidPieces => {
                write!(f, "Piece hashes do not match the declared payload size")
            }
            MetainfoError::InvalidPath(path) => {
                write!(f, "File path {:?} is not a safe relative path", path)
            }
        }
    }
}

impl Error for MetainfoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MetainfoError::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(err: serde_bencode::Error) -> Self {
        MetainfoError::Decode(err)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn single_file_metainfo() -> Metainfo {
        Metainfo {
            info: Info {
                name: "example.iso".to_string(),
                length: Some(81_000),
                piece_length: 32_768,
                pieces: ByteBuf::from(vec![0xaa; 3 * 20]),
                private: None,
                md5sum: None,
                files: None,
            },
            announce: Some("http://tracker.example/announce".to_string()),
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
            encoding: None,
        }
    }

    #[test]
    fn round_trips_through_bencode() {
        let metainfo = single_file_metainfo();
        let data = ser::to_bytes(&metainfo).unwrap();

        let decoded = Metainfo::deserialize(&data).unwrap();

        assert_eq!(decoded.info.name, "example.iso");
        assert_eq!(decoded.info.piece_length, 32_768);
        assert_eq!(decoded.total_length().unwrap(), 81_000);
        assert_eq!(
            decoded.announce.as_deref(),
            Some("http://tracker.example/announce")
        );
    }

    #[test]
    fn info_hash_is_sha1_of_raw_info_dict() {
        let metainfo = single_file_metainfo();
        let data = ser::to_bytes(&metainfo).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(ser::to_bytes(&metainfo.info).unwrap());
        let expected: [u8; 20] = hasher.finalize().into();

        assert_eq!(Metainfo::compute_info_hash(&data).unwrap(), expected);
    }

    #[test]
    fn builds_piece_table_with_short_last_piece() {
        let pieces = single_file_metainfo().parse_pieces().unwrap();

        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[&0].length(), 32_768);
        assert_eq!(pieces[&1].length(), 32_768);
        // 81_000 - 2 * 32_768
        assert_eq!(pieces[&2].length(), 15_464);
        assert_eq!(pieces[&0].hash(), &[0xaa; 20]);
    }

    #[test]
    fn rejects_piece_hash_count_mismatch() {
        let mut metainfo = single_file_metainfo();
        metainfo.info.pieces = ByteBuf::from(vec![0xaa; 2 * 20]);

        assert_matches!(metainfo.parse_pieces(), Err(MetainfoError::InvalidPieces));
    }

    #[test]
    fn lays_out_multi_file_torrents_under_the_torrent_name() {
        let mut metainfo = single_file_metainfo();
        metainfo.info.length = None;
        metainfo.info.files = Some(vec![
            FileEntry {
                length: 70_000,
                md5sum: None,
                path: vec!["disc1".to_string(), "a.bin".to_string()],
            },
            FileEntry {
                length: 11_000,
                md5sum: None,
                path: vec!["b.bin".to_string()],
            },
        ]);

        let layout = metainfo.file_layout().unwrap();

        assert_eq!(layout[0].0, PathBuf::from("example.iso/disc1/a.bin"));
        assert_eq!(layout[0].1, 70_000);
        assert_eq!(layout[1].0, PathBuf::from("example.iso/b.bin"));
        assert_eq!(metainfo.total_length().unwrap(), 81_000);
    }

    #[test]
    fn rejects_path_traversal_in_file_entries() {
        let mut metainfo = single_file_metainfo();
        metainfo.info.length = None;
        metainfo.info.files = Some(vec![FileEntry {
            length: 81_000,
            md5sum: None,
            path: vec!["..".to_string(), "evil".to_string()],
        }]);

        assert_matches!(metainfo.file_layout(), Err(MetainfoError::InvalidPath(_)));
    }

    #[test]
    fn announce_urls_flatten_tiers_and_dedupe() {
        let mut metainfo = single_file_metainfo();
        metainfo.announce_list = Some(vec![
            vec!["http://a/announce".to_string()],
            vec![
                "http://b/announce".to_string(),
                "http://a/announce".to_string(),
            ],
        ]);
        metainfo.announce = Some("http://c/announce".to_string());

        assert_eq!(
            metainfo.announce_urls(),
            vec!["http://a/announce", "http://b/announce", "http://c/announce"]
        );
    }
}
