//! `/proc/self/maps` parsing for the startup layout check.

use crate::error::PlatformError;

/// One mapped range of the process address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    pub beg: usize,
    pub end: usize,
    /// Backed by a file or the brk heap: program text, statics, libraries.
    pub image: bool,
}

impl MappedRange {
    #[must_use]
    pub fn overlaps(&self, beg: usize, end: usize) -> bool {
        self.beg < end && beg < self.end
    }
}

/// Parse each maps line into its `beg-end` range and pathname kind.
/// Malformed lines are skipped.
pub fn parse_maps(text: &str) -> impl Iterator<Item = MappedRange> + '_ {
    text.lines().filter_map(|line| {
        let mut fields = line.split_whitespace();
        let (beg, end) = fields.next()?.split_once('-')?;
        let path = fields.nth(4).unwrap_or("");
        Some(MappedRange {
            beg: usize::from_str_radix(beg, 16).ok()?,
            end: usize::from_str_radix(end, 16).ok()?,
            image: path.starts_with('/') || path == "[heap]",
        })
    })
}

/// First existing mapping that intersects any of `reserved`.
#[must_use]
pub fn find_conflict(text: &str, reserved: &[(usize, usize)]) -> Option<MappedRange> {
    parse_maps(text).find(|m| reserved.iter().any(|&(beg, end)| m.overlaps(beg, end)))
}

/// First file-backed or heap mapping outside the application window `app`.
/// Accesses to such memory would have no shadow.
#[must_use]
pub fn find_foreign_image(text: &str, app: (usize, usize)) -> Option<MappedRange> {
    parse_maps(text).find(|m| m.image && (m.beg < app.0 || m.end > app.1))
}

/// Fail if the live process already occupies any of `reserved`, or if its
/// image or heap lies outside the application window `app`.
#[cfg(target_os = "linux")]
pub fn check_layout(reserved: &[(usize, usize)], app: (usize, usize)) -> Result<(), PlatformError> {
    let text = std::fs::read_to_string("/proc/self/maps")?;
    if let Some(m) = find_conflict(&text, reserved) {
        return Err(PlatformError::LayoutConflict {
            addr: m.beg,
            end: m.end,
        });
    }
    match find_foreign_image(&text, app) {
        Some(m) => Err(PlatformError::OutsideAppWindow {
            addr: m.beg,
            end: m.end,
            app_beg: app.0,
            app_end: app.1,
        }),
        None => Ok(()),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn check_layout(_reserved: &[(usize, usize)], _app: (usize, usize)) -> Result<(), PlatformError> {
    // No maps file; MAP_FIXED_NOREPLACE-style reservation failure is the
    // only detection left.
    Ok(())
}
