use std::fmt::Display;

/// Event of an announce, the discriminants are the UDP wire values.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    None = 0,
    Completed = 1,
    #[default]
    Started = 2,
    Stopped = 3,
}

impl Event {
    /// Value of the `event` query parameter of HTTP announces, `None` is
    /// not sent.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Completed => Some("completed"),
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str().unwrap_or("none"))
    }
}
