//! Board drivers.
//!
//! Each serial driver owns a [`crate::session::BoardSession`] and maps its
//! board's command set onto exchanges. The DMD is a USB device with its own
//! report protocol and a typestate sequencing API.

pub mod coincidence;
pub mod dmd;
pub mod photodiode;
pub mod piezo;

pub use coincidence::{
    CoincidenceBoard, CoincidenceCounterDriver, CoincidenceSampler, CoincidenceState, Counts, LegacyCounterReader,
    LegacySampler,
};
pub use dmd::{Bitmap, DisplayMode, Dmd, DmdUsb, MockDmdUsb, PanelSize, PatternSequence};
pub use photodiode::{
    OpenLoopChannel, OpenLoopData, OpenLoopLimits, PhotodiodeDriver, PhotodiodeSampler,
    PhotodiodeState, PidParams,
};
pub use piezo::{PiezoDriver, PiezoState};
