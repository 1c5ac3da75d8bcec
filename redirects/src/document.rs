//! A `web.config` style XML document with a rewrite map section.
//!
//! The document keeps its original source text. New entries are spliced in
//! after the last child of the rewrite map when the document is serialized,
//! so everything else in the file is written back exactly as it was read.

use bred_core::UrlPair;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashSet;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};

const REWRITE_MAP: &str = "rewriteMap";
const ENTRY: &[u8] = b"add";
const KEY: &[u8] = b"key";
const VALUE: &[u8] = b"value";
const NAME: &[u8] = b"name";
const BOM: char = '\u{feff}';

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error for {0:?}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Document is not UTF-8: {0:?}")]
    Encoding(PathBuf),
    #[error("Invalid XML on line {line}")]
    Xml {
        line: usize,
        #[source]
        error: quick_xml::Error,
    },
    #[error("Ill-formed XML on line {line}: {message}")]
    IllFormed { line: usize, message: &'static str },
    #[error("No rewriteMap element found")]
    MissingRewriteMap(Option<String>),
    #[error("Rewrite map entry on line {line} has no {attribute} attribute")]
    MissingAttribute {
        line: usize,
        attribute: &'static str,
    },
}

/// Location of the rewrite map in the source text.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Section {
    /// The start tag, or the whole element if it is self-closing.
    start_tag: Range<usize>,
    self_closing: bool,
    /// Just after the last child content that isn't whitespace.
    insert_at: usize,
    /// Start of the end tag.
    end_tag: usize,
    indent: String,
    child_indent: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Document {
    source: String,
    section: Section,
    existing: Vec<UrlPair>,
    added: Vec<UrlPair>,
    index: HashSet<UrlPair>,
    keys: HashSet<String>,
}

impl Document {
    /// Read and parse the document at `path`.
    ///
    /// If `map` is provided, the first rewrite map with that `name` attribute
    /// is used; otherwise the first rewrite map in the document.
    pub fn load<P: AsRef<Path>>(path: P, map: Option<&str>) -> Result<Self, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|error| Error::Io(path.to_path_buf(), error))?;
        let source = String::from_utf8(bytes).map_err(|_| Error::Encoding(path.to_path_buf()))?;

        Self::parse(source, map)
    }

    pub fn parse(source: String, map: Option<&str>) -> Result<Self, Error> {
        let offset = if source.starts_with(BOM) {
            BOM.len_utf8()
        } else {
            0
        };

        let mut reader = Reader::from_str(&source[offset..]);
        let mut depth = 0;
        let mut seen_root = false;
        let mut section: Option<Section> = None;
        // Depth of the rewrite map's direct children while we are inside it.
        let mut child_depth: Option<usize> = None;
        let mut existing = vec![];

        loop {
            let start = offset + reader.buffer_position();
            let event = reader.read_event().map_err(|error| Error::Xml {
                line: line_at(&source, offset + reader.buffer_position()),
                error,
            })?;
            let end = offset + reader.buffer_position();

            match event {
                Event::Start(ref tag) | Event::Empty(ref tag) => {
                    let self_closing = matches!(event, Event::Empty(_));

                    if depth == 0 {
                        if seen_root {
                            return Err(ill_formed(&source, start, "multiple root elements"));
                        }
                        seen_root = true;
                    }

                    let attributes = attributes(tag).map_err(|error| Error::Xml {
                        line: line_at(&source, start),
                        error,
                    })?;

                    if section.is_none()
                        && tag.name().as_ref() == REWRITE_MAP.as_bytes()
                        && (map.is_none() || attribute(&attributes, NAME) == map)
                    {
                        section = Some(Section {
                            start_tag: start..end,
                            self_closing,
                            insert_at: end,
                            end_tag: end,
                            indent: indentation(&source, start).unwrap_or_default().to_string(),
                            child_indent: None,
                        });

                        if !self_closing {
                            child_depth = Some(depth + 1);
                        }
                    } else if let (Some(section), Some(child_depth)) =
                        (section.as_mut(), child_depth)
                    {
                        if depth == child_depth {
                            if tag.name().as_ref() == ENTRY {
                                let key = attribute(&attributes, KEY)
                                    .ok_or_else(|| missing(&source, start, "key"))?;
                                let value = attribute(&attributes, VALUE)
                                    .ok_or_else(|| missing(&source, start, "value"))?;

                                existing.push(UrlPair::new(key, value));
                            }

                            section.child_indent = indentation(&source, start).map(str::to_string);
                        }

                        section.insert_at = end;
                    }

                    if !self_closing {
                        depth += 1;
                    }
                }
                Event::End(_) => {
                    depth = match depth {
                        0 => return Err(ill_formed(&source, start, "unexpected end tag")),
                        depth => depth - 1,
                    };

                    if let (Some(section), Some(current)) = (section.as_mut(), child_depth) {
                        if current == depth + 1 {
                            section.end_tag = start;
                            child_depth = None;
                        } else {
                            section.insert_at = end;
                        }
                    }
                }
                Event::Text(text) => {
                    text.unescape().map_err(|error| Error::Xml {
                        line: line_at(&source, start),
                        error,
                    })?;

                    if !text.iter().all(u8::is_ascii_whitespace) {
                        if depth == 0 {
                            return Err(ill_formed(
                                &source,
                                start,
                                "text outside the root element",
                            ));
                        }

                        if let (Some(section), Some(_)) = (section.as_mut(), child_depth) {
                            section.insert_at = end;
                        }
                    }
                }
                Event::CData(_) | Event::Comment(_) | Event::PI(_) => {
                    if let (Some(section), Some(_)) = (section.as_mut(), child_depth) {
                        section.insert_at = end;
                    }
                }
                Event::Decl(_) | Event::DocType(_) => {}
                Event::Eof => {
                    if depth > 0 {
                        return Err(ill_formed(&source, start, "unclosed element"));
                    }
                    if !seen_root {
                        return Err(ill_formed(&source, start, "no root element"));
                    }
                    break;
                }
            }
        }

        let section = section.ok_or_else(|| Error::MissingRewriteMap(map.map(str::to_string)))?;
        let index = existing.iter().cloned().collect();
        let keys = existing.iter().map(|pair| pair.old_url.clone()).collect();

        Ok(Self {
            source,
            section,
            existing,
            added: vec![],
            index,
            keys,
        })
    }

    /// Whether the rewrite map has an entry with exactly this key and value.
    pub fn contains(&self, pair: &UrlPair) -> bool {
        self.index.contains(pair)
    }

    /// Whether the rewrite map has any entry with this key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Add an entry as the last child of the rewrite map.
    ///
    /// Returns `false` (and leaves the document unchanged) if the entry is
    /// already present.
    pub fn append(&mut self, pair: UrlPair) -> bool {
        if self.index.insert(pair.clone()) {
            self.keys.insert(pair.old_url.clone());
            self.added.push(pair);
            true
        } else {
            false
        }
    }

    /// All entries, in document order.
    pub fn entries(&self) -> impl Iterator<Item = &UrlPair> {
        self.existing.iter().chain(self.added.iter())
    }

    /// Entries appended since the document was loaded.
    pub fn added(&self) -> &[UrlPair] {
        &self.added
    }

    pub fn to_xml(&self) -> String {
        if self.added.is_empty() {
            return self.source.clone();
        }

        let section = &self.section;
        let newline = line_ending(&self.source);
        let child_indent = section
            .child_indent
            .clone()
            .unwrap_or_else(|| format!("{}{}", section.indent, indent_unit(&section.indent)));

        let mut entries = String::new();

        for pair in &self.added {
            if let Some(newline) = newline {
                entries.push_str(newline);
                entries.push_str(&child_indent);
            }

            entries.push_str(&format!(
                "<add key=\"{}\" value=\"{}\" />",
                quick_xml::escape::escape(&pair.old_url),
                quick_xml::escape::escape(&pair.new_url)
            ));
        }

        let mut output = String::with_capacity(self.source.len() + entries.len() + 32);

        if section.self_closing {
            let tag = &self.source[section.start_tag.clone()];
            let open = tag.strip_suffix("/>").unwrap_or(tag).trim_end();

            output.push_str(&self.source[..section.start_tag.start]);
            output.push_str(open);
            output.push('>');
            output.push_str(&entries);
            if let Some(newline) = newline {
                output.push_str(newline);
                output.push_str(&section.indent);
            }
            output.push_str("</");
            output.push_str(REWRITE_MAP);
            output.push('>');
            output.push_str(&self.source[section.start_tag.end..]);
        } else {
            let gap = &self.source[section.insert_at..section.end_tag];

            output.push_str(&self.source[..section.insert_at]);
            output.push_str(&entries);
            if let Some(newline) = newline {
                if !gap.contains('\n') {
                    output.push_str(newline);
                    output.push_str(&section.indent);
                }
            }
            output.push_str(&self.source[section.insert_at..]);
        }

        output
    }

    /// Atomically replace the file at `path` with the serialized document.
    ///
    /// The new content is written to a temporary file in the same directory,
    /// which is then renamed over the target, so on failure the target is
    /// left as it was. If `path` is a symlink, the file it points to is
    /// replaced and the link is kept.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let io_error = |error: std::io::Error| Error::Io(path.to_path_buf(), error);

        let target = match std::fs::canonicalize(path) {
            Ok(target) => target,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => path.to_path_buf(),
            Err(error) => return Err(io_error(error)),
        };

        let permissions = match std::fs::metadata(&target) {
            Ok(metadata) => Some(metadata.permissions()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => return Err(io_error(error)),
        };

        if permissions
            .as_ref()
            .map(|permissions| permissions.readonly())
            .unwrap_or(false)
        {
            return Err(io_error(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "document is read-only",
            )));
        }

        let dir = target
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
        file.write_all(self.to_xml().as_bytes()).map_err(io_error)?;
        file.as_file().sync_all().map_err(io_error)?;

        if let Some(permissions) = permissions {
            std::fs::set_permissions(file.path(), permissions).map_err(io_error)?;
        }

        file.persist(&target).map_err(|error| io_error(error.error))?;

        log::debug!("Wrote {} new entries to {:?}", self.added.len(), path);

        Ok(())
    }
}

impl Error {
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Encoding(_)
                | Self::Xml { .. }
                | Self::IllFormed { .. }
                | Self::MissingAttribute { .. }
        )
    }
}

fn attributes(tag: &BytesStart) -> Result<Vec<(Vec<u8>, String)>, quick_xml::Error> {
    tag.attributes()
        .map(|attribute| {
            let attribute = attribute?;
            Ok((
                attribute.key.as_ref().to_vec(),
                attribute.unescape_value()?.into_owned(),
            ))
        })
        .collect()
}

fn attribute<'a>(attributes: &'a [(Vec<u8>, String)], name: &[u8]) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Leading whitespace of the line, if the offset is the first non-blank
/// position on it.
fn indentation(source: &str, offset: usize) -> Option<&str> {
    let before = &source[..offset];
    let line_start = before.rfind('\n').map(|index| index + 1)?;
    let indent = &before[line_start..];

    indent
        .chars()
        .all(|c| c == ' ' || c == '\t')
        .then_some(indent)
}

fn indent_unit(indent: &str) -> &'static str {
    if indent.contains('\t') {
        "\t"
    } else {
        "  "
    }
}

fn line_ending(source: &str) -> Option<&'static str> {
    if source.contains("\r\n") {
        Some("\r\n")
    } else if source.contains('\n') {
        Some("\n")
    } else {
        None
    }
}

fn line_at(source: &str, offset: usize) -> usize {
    let bytes = source.as_bytes();

    bytes[..offset.min(bytes.len())]
        .iter()
        .filter(|byte| **byte == b'\n')
        .count()
        + 1
}

fn ill_formed(source: &str, offset: usize, message: &'static str) -> Error {
    Error::IllFormed {
        line: line_at(source, offset),
        message,
    }
}

fn missing(source: &str, offset: usize, attribute: &'static str) -> Error {
    Error::MissingAttribute {
        line: line_at(source, offset),
        attribute,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEB_CONFIG: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<configuration>
  <!-- Site redirects -->
  <system.webServer>
    <rewrite>
      <rewriteMaps>
        <rewriteMap name="Redirects">
          <add key="/existing" value="/kept" />
          <add key="/quoted" value="/it&apos;s &amp; &quot;fine&quot;" />
        </rewriteMap>
      </rewriteMaps>
      <rules>
        <rule name="Redirect rule" stopProcessing="true">
          <match url=".*" />
        </rule>
      </rules>
    </rewrite>
  </system.webServer>
</configuration>
"#;

    #[test]
    fn parse_existing_entries() {
        let document = Document::parse(WEB_CONFIG.to_string(), None).unwrap();

        assert_eq!(
            document.entries().cloned().collect::<Vec<_>>(),
            vec![
                UrlPair::new("/existing", "/kept"),
                UrlPair::new("/quoted", "/it's & \"fine\""),
            ]
        );
        assert!(document.contains(&UrlPair::new("/quoted", "/it's & \"fine\"")));
        assert!(!document.contains(&UrlPair::new("/existing", "/Kept")));
        assert!(document.contains_key("/existing"));
    }

    #[test]
    fn unchanged_document_is_identical() {
        let document = Document::parse(WEB_CONFIG.to_string(), None).unwrap();

        assert_eq!(document.to_xml(), WEB_CONFIG);
    }

    #[test]
    fn append_after_last_entry() {
        let mut document = Document::parse(WEB_CONFIG.to_string(), None).unwrap();

        assert!(document.append(UrlPair::new("/a", "/b")));
        assert!(document.append(UrlPair::new("/c?x=1&y=2", "/\"d\"")));
        assert!(!document.append(UrlPair::new("/a", "/b")));

        let expected = WEB_CONFIG.replace(
            "fine&quot;\" />\n",
            "fine&quot;\" />\n          <add key=\"/a\" value=\"/b\" />\n          <add key=\"/c?x=1&amp;y=2\" value=\"/&quot;d&quot;\" />\n",
        );

        assert_eq!(document.to_xml(), expected);

        let reparsed = Document::parse(document.to_xml(), None).unwrap();

        assert_eq!(
            reparsed.entries().cloned().collect::<Vec<_>>(),
            document.entries().cloned().collect::<Vec<_>>()
        );
    }

    #[test]
    fn append_to_empty_section() {
        let source = "<configuration>\r\n  <rewriteMaps>\r\n    <rewriteMap name=\"Redirects\"></rewriteMap>\r\n  </rewriteMaps>\r\n</configuration>\r\n";
        let mut document = Document::parse(source.to_string(), None).unwrap();
        document.append(UrlPair::new("/a", "/b"));

        assert_eq!(
            document.to_xml(),
            "<configuration>\r\n  <rewriteMaps>\r\n    <rewriteMap name=\"Redirects\">\r\n      <add key=\"/a\" value=\"/b\" />\r\n    </rewriteMap>\r\n  </rewriteMaps>\r\n</configuration>\r\n"
        );
    }

    #[test]
    fn append_to_self_closing_section() {
        let source = "<configuration>\n\t<rewriteMap name=\"Redirects\" />\n</configuration>\n";
        let mut document = Document::parse(source.to_string(), None).unwrap();
        document.append(UrlPair::new("/a", "/b"));

        assert_eq!(
            document.to_xml(),
            "<configuration>\n\t<rewriteMap name=\"Redirects\">\n\t\t<add key=\"/a\" value=\"/b\" />\n\t</rewriteMap>\n</configuration>\n"
        );
    }

    #[test]
    fn append_to_single_line_document() {
        let source = "<configuration><rewriteMap><add key=\"/x\" value=\"/y\"/></rewriteMap></configuration>";
        let mut document = Document::parse(source.to_string(), None).unwrap();
        document.append(UrlPair::new("/a", "/b"));

        assert_eq!(
            document.to_xml(),
            "<configuration><rewriteMap><add key=\"/x\" value=\"/y\"/><add key=\"/a\" value=\"/b\" /></rewriteMap></configuration>"
        );
    }

    #[test]
    fn nested_entries_are_not_direct_children() {
        let source = "<configuration>\n  <rewriteMap>\n    <group>\n      <add key=\"/a\" value=\"/b\" />\n    </group>\n  </rewriteMap>\n  <add key=\"/c\" value=\"/d\" />\n</configuration>\n";
        let document = Document::parse(source.to_string(), None).unwrap();

        assert_eq!(document.entries().count(), 0);
    }

    #[test]
    fn select_first_section() {
        let source = "<configuration>\n  <rewriteMap name=\"First\">\n    <add key=\"/a\" value=\"/b\" />\n  </rewriteMap>\n  <rewriteMap name=\"Second\">\n    <add key=\"/c\" value=\"/d\" />\n  </rewriteMap>\n</configuration>\n";

        let first = Document::parse(source.to_string(), None).unwrap();
        let second = Document::parse(source.to_string(), Some("Second")).unwrap();

        assert_eq!(first.entries().collect::<Vec<_>>(), vec![&UrlPair::new("/a", "/b")]);
        assert_eq!(second.entries().collect::<Vec<_>>(), vec![&UrlPair::new("/c", "/d")]);

        assert!(matches!(
            Document::parse(source.to_string(), Some("Third")),
            Err(Error::MissingRewriteMap(Some(name))) if name == "Third"
        ));
    }

    #[test]
    fn missing_section() {
        let source = "<?xml version=\"1.0\"?>\n<configuration>\n  <rewriteMaps />\n</configuration>\n";

        assert!(matches!(
            Document::parse(source.to_string(), None),
            Err(Error::MissingRewriteMap(None))
        ));
    }

    #[test]
    fn malformed_documents() {
        let inputs = [
            "",
            "old,new\n/a,/b\n",
            "<configuration>\n  <rewriteMap>\n</configuration>\n",
            "<configuration>\n  <rewriteMap>\n  </rewriteMap>\n",
            "<configuration><rewriteMap key=\"a\" key=\"b\"></rewriteMap></configuration>",
            "<configuration><rewriteMap/></configuration><configuration/>",
            "<configuration>&undefined;<rewriteMap/></configuration>",
        ];

        for input in inputs {
            let result = Document::parse(input.to_string(), None);

            assert!(
                matches!(&result, Err(error) if error.is_malformed()),
                "Expected malformed error for {:?}, got {:?}",
                input,
                result
            );
        }
    }

    #[test]
    fn entry_without_value() {
        let source = "<configuration>\n  <rewriteMap>\n    <add key=\"/a\" />\n  </rewriteMap>\n</configuration>\n";

        match Document::parse(source.to_string(), None) {
            Err(Error::MissingAttribute { line, attribute }) => {
                assert_eq!(line, 3);
                assert_eq!(attribute, "value");
            }
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn byte_order_mark_is_preserved() {
        let source = format!("{}<configuration>\n  <rewriteMap>\n  </rewriteMap>\n</configuration>\n", BOM);
        let mut document = Document::parse(source.clone(), None).unwrap();
        document.append(UrlPair::new("/a", "/b"));

        assert_eq!(
            document.to_xml(),
            source.replace("<rewriteMap>\n", "<rewriteMap>\n    <add key=\"/a\" value=\"/b\" />\n")
        );
    }

    #[test]
    fn save_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web.config");
        std::fs::write(&path, WEB_CONFIG).unwrap();

        let mut document = Document::load(&path, None).unwrap();
        document.append(UrlPair::new("/a", "/b"));
        document.save(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), document.to_xml());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn save_through_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("site.config");
        let link = dir.path().join("web.config");
        std::fs::write(&target, WEB_CONFIG).unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut document = Document::load(&link, None).unwrap();
        document.append(UrlPair::new("/a", "/b"));
        document.save(&link).unwrap();

        assert!(std::fs::symlink_metadata(&link)
            .unwrap()
            .file_type()
            .is_symlink());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), document.to_xml());
    }

    #[test]
    fn keys_include_appended_entries() {
        let mut document = Document::parse(WEB_CONFIG.to_string(), None).unwrap();

        assert!(!document.contains_key("/a"));
        document.append(UrlPair::new("/a", "/b"));
        assert!(document.contains_key("/a"));
        assert!(!document.contains_key("/b"));
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web.config");

        match Document::load(&path, None) {
            Err(Error::Io(missing, error)) => {
                assert_eq!(missing, path);
                assert_eq!(error.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("Unexpected result: {:?}", other),
        }
    }
}
