use rfc5321::{ForwardPath, ReversePath};
use serde::{Deserialize, Serialize};

/// A bare `user@domain` envelope address, or the empty string for the
/// null sender used on bounce/DSN envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Eq, Hash)]
#[serde(transparent)]
pub struct EnvelopeAddress(String);

impl EnvelopeAddress {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        if text.is_empty() {
            Ok(Self::null_sender())
        } else {
            let fields: Vec<&str> = text.split('@').collect();
            anyhow::ensure!(fields.len() == 2, "expected user@domain");
            Ok(Self(text.to_string()))
        }
    }

    pub fn user(&self) -> &str {
        match self.0.find('@') {
            Some(at) => &self.0[..at],
            None => "",
        }
    }

    pub fn domain(&self) -> &str {
        match self.0.find('@') {
            Some(at) => &self.0[at + 1..],
            None => "",
        }
    }

    pub fn is_null_sender(&self) -> bool {
        self.0.is_empty()
    }

    pub fn null_sender() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EnvelopeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryInto<ForwardPath> for &EnvelopeAddress {
    type Error = &'static str;
    fn try_into(self) -> Result<ForwardPath, Self::Error> {
        ForwardPath::try_from(self.0.as_str())
    }
}

impl TryInto<ReversePath> for &EnvelopeAddress {
    type Error = &'static str;
    fn try_into(self) -> Result<ReversePath, Self::Error> {
        ReversePath::try_from(self.0.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_and_domain() {
        let addr = EnvelopeAddress::parse("joe@example.com").unwrap();
        assert_eq!(addr.user(), "joe");
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn null_sender_roundtrip() {
        let addr = EnvelopeAddress::parse("").unwrap();
        assert!(addr.is_null_sender());
        assert_eq!(addr.to_string(), "");
    }
}
