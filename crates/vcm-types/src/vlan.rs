//! VLAN tag used as a per-port override on the distributed switch.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// VLAN tag assigned to a single distributed switch port (0-4094).
///
/// Unlike a bridge VLAN, an override tag may be 0: the tag only has to be
/// unique among the ports served by one dataplane agent, which uses it to
/// tell tenants apart. 4095 is reserved by IEEE 802.1Q and never assigned.
///
/// # Examples
///
/// ```
/// use vcm_types::VlanId;
///
/// let vlan = VlanId::new(100).unwrap();
/// assert_eq!(vlan.as_u16(), 100);
/// assert!(VlanId::new(4095).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    /// Lowest assignable tag.
    pub const MIN: u16 = 0;

    /// Highest assignable tag.
    pub const MAX: u16 = 4094;

    /// The lowest tag as a `VlanId`.
    pub const FIRST: VlanId = VlanId(Self::MIN);

    /// The highest tag as a `VlanId`.
    pub const LAST: VlanId = VlanId(Self::MAX);

    /// Creates a new VLAN tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is above [`VlanId::MAX`].
    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    /// Returns the tag as a u16.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u16 = s
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidVlanId(u16::MAX))?;
        VlanId::new(id)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}
