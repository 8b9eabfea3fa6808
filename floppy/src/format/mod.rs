//! Per-format image handlers (`spec.md` §4.3).

pub mod adf;
pub mod apple2;
pub mod da;
pub mod dsk;
pub mod hfe;
pub mod raw;

use log::{debug, warn};
use strum::{Display, EnumIter};

use crate::{FormatError, FormatResult, ImageHandler};

/// Which on-disk format an image file was recognised as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum ImageType {
    Raw,
    Adf,
    Dsk,
    Apple2,
    Hfe,
    DirectAccess,
}

/// Probe `data` against every known *file-backed* format in turn and return
/// a constructed handler for the first one that recognises it, along with
/// its type. Direct-Access is deliberately excluded: it is never discovered
/// from file contents, only engaged explicitly by the drive layer when the
/// host steps to [`da::DA_CYL`].
///
/// Mirrors `twvd-snow`'s `Autodetect` loader dispatch (`loaders/auto.rs`):
/// each format's `open` is tried in a fixed, most-specific-first order so
/// that a signature-bearing format (ADF/DSK/HFE) is never misidentified as
/// a raw sector image.
pub fn autodetect(data: &[u8]) -> FormatResult<(ImageType, Box<dyn ImageHandler>)> {
    if let Ok(mut h) = try_open::<hfe::HfeHandler>(data) {
        debug!("autodetect: matched {:?}", ImageType::Hfe);
        return Ok((ImageType::Hfe, Box::new(h.take())));
    }
    if let Ok(mut h) = try_open::<dsk::DskHandler>(data) {
        debug!("autodetect: matched {:?}", ImageType::Dsk);
        return Ok((ImageType::Dsk, Box::new(h.take())));
    }
    if let Ok(mut h) = try_open::<adf::AdfHandler>(data) {
        debug!("autodetect: matched {:?}", ImageType::Adf);
        return Ok((ImageType::Adf, Box::new(h.take())));
    }
    if let Ok(mut h) = try_open::<apple2::Apple2Handler>(data) {
        debug!("autodetect: matched {:?}", ImageType::Apple2);
        return Ok((ImageType::Apple2, Box::new(h.take())));
    }
    if let Ok(mut h) = try_open::<raw::RawHandler>(data) {
        debug!("autodetect: matched {:?}", ImageType::Raw);
        return Ok((ImageType::Raw, Box::new(h.take())));
    }
    warn!("autodetect: no format recognised {} byte image", data.len());
    Err(FormatError::UnrecognisedGeometry { size: data.len() as u64 })
}

struct Opened<T>(Option<T>);

impl<T> Opened<T> {
    fn take(&mut self) -> T {
        self.0.take().expect("opened handler probed exactly once")
    }
}

fn try_open<T: ImageHandler + Default>(data: &[u8]) -> FormatResult<Opened<T>> {
    let mut h = T::default();
    h.open(data)?;
    Ok(Opened(Some(h)))
}
