use crate::Error;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// An old URL and the URL it should redirect to.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct UrlPair {
    pub old_url: String,
    pub new_url: String,
}

impl UrlPair {
    pub fn new<O: Into<String>, N: Into<String>>(old_url: O, new_url: N) -> Self {
        Self {
            old_url: old_url.into(),
            new_url: new_url.into(),
        }
    }
}

/// Read pairs from comma-delimited rows, discarding the first (header) row.
///
/// Fields are split literally on commas: quote characters have no special
/// meaning and whitespace is preserved. Any fields after the second are
/// ignored, but a row with fewer than two fields (including a blank line) is
/// rejected.
pub fn read_pairs<R: Read>(mut reader: R) -> Result<Vec<UrlPair>, Error> {
    let mut input = String::new();
    reader.read_to_string(&mut input)?;

    let mut builder = csv::ReaderBuilder::new();
    builder.has_headers(false).flexible(true).quoting(false);

    let mut pairs = vec![];

    // The reader drops empty lines, so we give it one row at a time.
    for (index, line) in input.lines().enumerate().skip(1) {
        let mut record = csv::StringRecord::new();
        builder
            .from_reader(line.as_bytes())
            .read_record(&mut record)?;

        match (record.get(0), record.get(1)) {
            (Some(old_url), Some(new_url)) => {
                pairs.push(UrlPair::new(old_url, new_url));
            }
            _ => {
                return Err(Error::MalformedRow {
                    line: index as u64 + 1,
                    content: line.to_string(),
                });
            }
        }
    }

    log::debug!("Read {} pairs", pairs.len());

    Ok(pairs)
}

pub fn load_pairs<P: AsRef<Path>>(path: P) -> Result<Vec<UrlPair>, Error> {
    let file = File::open(path.as_ref()).map_err(|error| Error::from_io(path.as_ref(), error))?;

    read_pairs(BufReader::new(file))
}
