//! Outgoing requests.

use std::fmt;

use bytes::Bytes;

use crate::Frame;

/// A command sent to a node: the name followed by its arguments.
///
/// On the wire a command is an array of bulk strings.
///
/// # Example
///
/// ```
/// use sentinel_resp::Command;
///
/// let command = Command::new("SENTINEL").arg("get-master-addr-by-name").arg("mymaster");
/// assert_eq!(command.name(), "SENTINEL");
/// assert_eq!(command.args().len(), 3);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    /// Starts a command with the given name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self { parts: vec![Bytes::copy_from_slice(name.as_ref())] }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.parts.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Returns the command name, lossily decoded.
    #[must_use]
    pub fn name(&self) -> String {
        self.parts.first().map(|name| String::from_utf8_lossy(name).into_owned()).unwrap_or_default()
    }

    /// Returns every part including the name.
    #[must_use]
    pub fn args(&self) -> &[Bytes] {
        &self.parts
    }

    /// Parses a command out of a decoded request frame.
    ///
    /// Returns `None` unless the frame is a non-empty array of strings.
    #[must_use]
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let items = frame.into_array()?;
        if items.is_empty() {
            return None;
        }
        let parts = items
            .into_iter()
            .map(|item| match item {
                Frame::Bulk(Some(data)) => Some(data),
                Frame::Simple(value) => Some(Bytes::from(value)),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self { parts })
    }

    pub(crate) fn encoded_len(&self) -> usize {
        // "*<n>\r\n" plus "$<len>\r\n<data>\r\n" per part; 24 covers the headers.
        self.parts.iter().map(|part| part.len() + 24).sum::<usize>() + 16
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for part in &self.parts {
            list.entry(&String::from_utf8_lossy(part));
        }
        list.finish()
    }
}
