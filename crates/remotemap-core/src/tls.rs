//! TLS directory access.

use crate::pe::{IMAGE_DIRECTORY_ENTRY_TLS, ImageSource, PeImage, advance};
use crate::Result;

const MAX_CALLBACKS: u32 = 256;

/// RVAs of the image's TLS callbacks, in call order.
///
/// Callback pointers are stored as VAs against the preferred base, so this
/// must run before relocations are applied.
pub fn tls_callbacks<S: ImageSource>(image: &PeImage<S>) -> Result<Vec<u32>> {
    let dir = image.headers().directory(IMAGE_DIRECTORY_ENTRY_TLS);
    if !dir.is_present() {
        return Ok(Vec::new());
    }

    let headers = image.headers();
    let pointer_size = headers.pointer_size() as u32;
    let array_va = image.read_pointer(advance(dir.virtual_address, (3 * pointer_size) as usize)?)?;
    if array_va == 0 {
        return Ok(Vec::new());
    }

    let Some(array_rva) = va_to_rva(array_va, headers.image_base) else {
        log::warn!("TLS callback array 0x{:X} lies outside the image", array_va);
        return Ok(Vec::new());
    };

    let mut callbacks = Vec::new();
    for i in 0..MAX_CALLBACKS {
        let callback = image.read_pointer(advance(array_rva, (i * pointer_size) as usize)?)?;
        if callback == 0 {
            break;
        }
        match va_to_rva(callback, headers.image_base) {
            Some(rva) => callbacks.push(rva),
            None => log::warn!("Skipping TLS callback 0x{:X} outside the image", callback),
        }
    }
    Ok(callbacks)
}

fn va_to_rva(va: u64, image_base: u64) -> Option<u32> {
    va.checked_sub(image_base).and_then(|rva| u32::try_from(rva).ok())
}
