//! Getting hold of the PIN that unlocks a token.

use std::fmt;

use log::debug;
use secrecy::SecretString;
use serde::{de, Deserialize, Deserializer};

use crate::card::module::{PinStatus, SlotId};
use crate::error::Error;


//------------ PinPrompt -----------------------------------------------------

/// What a provider gets to know about the token it is asked a PIN for.
#[derive(Clone, Debug)]
pub struct PinPrompt {
    pub slot: SlotId,
    pub token_label: String,

    /// The token can obtain the PIN by itself.
    pub protected_path: bool,

    pub pin_status: PinStatus,
}


//------------ PinSecret -----------------------------------------------------

/// The material handed to `C_Login`.
pub enum PinSecret {
    /// A PIN typed by the user. Wiped from memory when dropped.
    Pin(SecretString),

    /// Log in without a PIN and let the module obtain it itself.
    ProtectedPath,
}

impl fmt::Debug for PinSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PinSecret::Pin(_) => write!(f, "Pin([REDACTED])"),
            PinSecret::ProtectedPath => write!(f, "ProtectedPath"),
        }
    }
}


//------------ PinProvider ---------------------------------------------------

/// A source of PINs.
///
/// Implementations must not log or keep the secret.
pub trait PinProvider {
    fn acquire_pin(&self, prompt: &PinPrompt) -> Result<PinSecret, Error>;
}


//------------ ConsolePinProvider --------------------------------------------

/// Asks for the PIN on the terminal without echoing it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsolePinProvider;

impl ConsolePinProvider {
    fn prompt_text(prompt: &PinPrompt) -> String {
        let mut text = format!("Enter PIN for '{}' (slot {})", prompt.token_label, prompt.slot);
        if prompt.pin_status.final_try {
            text.push_str(" [last attempt before the PIN is locked]");
        } else if prompt.pin_status.count_low {
            text.push_str(" [a wrong PIN was entered before]");
        }
        text.push_str(": ");
        text
    }
}

impl PinProvider for ConsolePinProvider {
    fn acquire_pin(&self, prompt: &PinPrompt) -> Result<PinSecret, Error> {
        let pin = rpassword::prompt_password(Self::prompt_text(prompt))
            .map_err(|e| Error::PinUnavailable(format!("cannot read PIN from terminal: {}", e)))?;
        if pin.is_empty() {
            return Err(Error::PinUnavailable("no PIN entered".to_string()));
        }
        debug!("PIN entered for slot {}", prompt.slot);
        Ok(PinSecret::Pin(SecretString::from(pin)))
    }
}


//------------ EidClientPinProvider ------------------------------------------

/// Leaves the PIN entry to the eID client application.
///
/// The vendor module asks the running client for the PIN when it is logged
/// in with a NULL PIN. That only works for tokens that advertise a protected
/// authentication path.
#[derive(Clone, Copy, Debug, Default)]
pub struct EidClientPinProvider;

impl PinProvider for EidClientPinProvider {
    fn acquire_pin(&self, prompt: &PinPrompt) -> Result<PinSecret, Error> {
        if prompt.protected_path {
            debug!("Slot {} will ask the eID client for the PIN", prompt.slot);
            Ok(PinSecret::ProtectedPath)
        } else {
            Err(Error::PinUnavailable(format!(
                "the eID client cannot be reached through token '{}' in slot {}",
                prompt.token_label, prompt.slot
            )))
        }
    }
}


//------------ PinSource -----------------------------------------------------

/// Where PINs come from, chosen once at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinSource {
    Console,
    EidClient,
}

impl PinSource {
    pub fn provider(self) -> Box<dyn PinProvider> {
        match self {
            PinSource::Console => Box::new(ConsolePinProvider),
            PinSource::EidClient => Box::new(EidClientPinProvider),
        }
    }
}

impl fmt::Display for PinSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PinSource::Console => write!(f, "console"),
            PinSource::EidClient => write!(f, "eid-client"),
        }
    }
}

impl<'de> Deserialize<'de> for PinSource {
    fn deserialize<D>(d: D) -> Result<PinSource, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "console" => Ok(PinSource::Console),
            "eid-client" => Ok(PinSource::EidClient),
            _ => Err(de::Error::custom(format!(
                "expected \"console\" or \"eid-client\", found: \"{}\"",
                string
            ))),
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(protected_path: bool) -> PinPrompt {
        PinPrompt {
            slot: SlotId(1),
            token_label: "SIG_EP".to_string(),
            protected_path,
            pin_status: PinStatus::default(),
        }
    }

    #[test]
    fn eid_client_uses_protected_path() {
        let secret = EidClientPinProvider.acquire_pin(&prompt(true)).unwrap();
        assert!(matches!(secret, PinSecret::ProtectedPath));
    }

    #[test]
    fn eid_client_needs_protected_path() {
        let err = EidClientPinProvider.acquire_pin(&prompt(false)).unwrap_err();
        assert!(matches!(err, Error::PinUnavailable(_)));
    }

    #[test]
    fn console_prompt_warns_on_final_try() {
        let mut p = prompt(false);
        p.pin_status.final_try = true;
        let text = ConsolePinProvider::prompt_text(&p);
        assert!(text.starts_with("Enter PIN for 'SIG_EP' (slot 1)"));
        assert!(text.contains("last attempt"));
    }

    #[test]
    fn secret_is_not_printed() {
        let secret = PinSecret::Pin(SecretString::from("1234".to_string()));
        assert!(!format!("{:?}", secret).contains("1234"));
    }
}
