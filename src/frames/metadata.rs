use std::fmt;

/// A metadata message, typically a small XML document.
///
/// Metadata flows in both directions on every connection: a sender's
/// metadata reaches its receivers, and a receiver's metadata reaches the
/// sender it is connected to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFrame {
    pub data: String,
    pub timecode: i64,
}

impl MetadataFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: impl Into<String>, timecode: i64) -> Self {
        MetadataFrame {
            data: data.into(),
            timecode,
        }
    }
}

/// Program/preview tally state.
///
/// On the wire this is the metadata element
/// `<ndi_tally on_program="true" on_preview="false"/>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub on_program: bool,
    pub on_preview: bool,
}

impl Tally {
    pub fn new(on_program: bool, on_preview: bool) -> Self {
        Tally {
            on_program,
            on_preview,
        }
    }

    /// Combines two tallies; a source is on program if any viewer has it on
    /// program.
    #[must_use]
    pub fn merge(self, other: Tally) -> Tally {
        Tally {
            on_program: self.on_program || other.on_program,
            on_preview: self.on_preview || other.on_preview,
        }
    }

    pub fn to_metadata(self) -> MetadataFrame {
        MetadataFrame::with_data(self.to_string(), 0)
    }

    /// Parses a tally element. Returns `None` for any other metadata.
    pub fn from_metadata(frame: &MetadataFrame) -> Option<Tally> {
        let xml = frame.data.trim();
        let body = xml.strip_prefix("<ndi_tally")?;
        if !body.starts_with(char::is_whitespace) && !body.starts_with('/') {
            return None;
        }
        Some(Tally {
            on_program: attribute(body, "on_program")? == "true",
            on_preview: attribute(body, "on_preview")? == "true",
        })
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"<ndi_tally on_program="{}" on_preview="{}"/>"#,
            self.on_program, self.on_preview
        )
    }
}

fn attribute<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let start = body.find(&format!("{name}="))? + name.len() + 1;
    let rest = &body[start..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}
