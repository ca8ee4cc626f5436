//! # Register Map Resolver
//!
//! The device's register space has a fixed low region and a variable region
//! whose layout depends on two counts reported by the hardware: `S` (cell
//! count) and `N` (temperature-sensor count). Those counts are read once per
//! session from the fixed region; [`RegisterLayout::resolve`] then computes
//! where every variable-region field lives. The layout is cached for the
//! session's lifetime and invalidated if the device reports different counts
//! (treated as a new identity).

/// Register holding the cell count `S`
pub const CELL_COUNT_REGISTER: u16 = 0x013F;

/// Register holding the temperature-sensor count `N`
///
/// Adjacent to [`CELL_COUNT_REGISTER`] so both counts arrive in a single
/// 2-register read.
pub const TEMP_SENSOR_COUNT_REGISTER: u16 = 0x0140;

/// First register of the variable region
pub const VARIABLE_REGION_BASE: u16 = 0x0141;

/// Register count of each fixed-width identity text field
pub const IDENTITY_TEXT_REGISTERS: u16 = 16;

/// Register count of the Bluetooth MAC field
pub const BLUETOOTH_MAC_REGISTERS: u16 = 5;

/// Total registers covered by one identity read: three 16-register text
/// fields, the 16-register group id, and the 5-register MAC
pub const IDENTITY_REGISTER_COUNT: u16 =
    IDENTITY_TEXT_REGISTERS * 3 + IDENTITY_TEXT_REGISTERS + BLUETOOTH_MAC_REGISTERS;

/// Half-open register address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpan {
    pub start: u16,
    pub end: u16,
}

impl RegisterSpan {
    /// Number of registers in the span
    pub fn count(&self) -> u16 {
        self.end - self.start
    }

    /// Whether the span lies entirely within `[address, address + quantity)`
    pub fn contained_in(&self, address: u16, quantity: u16) -> bool {
        self.start >= address && u32::from(self.end) <= u32::from(address) + u32::from(quantity)
    }
}

/// Resolved variable-region layout for one device identity
///
/// Immutable once computed. The four identity fields following the
/// temperatures are contiguous, so a single [`IDENTITY_REGISTER_COUNT`]-register
/// read starting at `hw_model.start` covers all of them; splitting that read
/// back into named fields is the parameter decoder's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    /// Cell count the layout was derived from
    pub cell_count: u16,
    /// Temperature-sensor count the layout was derived from
    pub temp_sensor_count: u16,
    pub cell_voltages: RegisterSpan,
    pub cell_temperatures: RegisterSpan,
    pub hw_model: RegisterSpan,
    pub battery_group_id: RegisterSpan,
    pub board_code: RegisterSpan,
    pub bluetooth_mac: RegisterSpan,
}

impl RegisterLayout {
    /// Compute the variable-region layout from the runtime-observed counts
    pub fn resolve(cell_count: u16, temp_sensor_count: u16) -> Self {
        let mut cursor = VARIABLE_REGION_BASE;
        let mut next = |count: u16| {
            let span = RegisterSpan { start: cursor, end: cursor + count };
            cursor = span.end;
            span
        };

        Self {
            cell_count,
            temp_sensor_count,
            cell_voltages: next(cell_count),
            cell_temperatures: next(temp_sensor_count),
            hw_model: next(IDENTITY_TEXT_REGISTERS),
            battery_group_id: next(IDENTITY_TEXT_REGISTERS),
            board_code: next(IDENTITY_TEXT_REGISTERS),
            bluetooth_mac: next(BLUETOOTH_MAC_REGISTERS),
        }
    }

    /// Whether a layout computed from these counts would differ
    pub fn matches(&self, cell_count: u16, temp_sensor_count: u16) -> bool {
        self.cell_count == cell_count && self.temp_sensor_count == temp_sensor_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_determinism() {
        let layout = RegisterLayout::resolve(8, 4);

        assert_eq!(layout.cell_voltages, RegisterSpan { start: 0x141, end: 0x149 });
        assert_eq!(layout.cell_temperatures, RegisterSpan { start: 0x149, end: 0x14D });
        assert_eq!(layout.hw_model, RegisterSpan { start: 0x14D, end: 0x15D });
        assert_eq!(layout.battery_group_id, RegisterSpan { start: 0x15D, end: 0x16D });
        assert_eq!(layout.board_code, RegisterSpan { start: 0x16D, end: 0x17D });
        assert_eq!(layout.bluetooth_mac, RegisterSpan { start: 0x17D, end: 0x182 });
    }

    #[test]
    fn test_identity_read_covers_all_fields() {
        let layout = RegisterLayout::resolve(16, 8);
        let start = layout.hw_model.start;
        assert_eq!(start + IDENTITY_REGISTER_COUNT, layout.bluetooth_mac.end);
        assert_eq!(IDENTITY_REGISTER_COUNT, 53);
    }

    #[test]
    fn test_span_containment() {
        let span = RegisterSpan { start: 0x150, end: 0x152 };
        assert!(span.contained_in(0x150, 2));
        assert!(span.contained_in(0x140, 0x20));
        assert!(!span.contained_in(0x150, 1)); // second register missing
        assert!(!span.contained_in(0x151, 4)); // first register missing
    }

    #[test]
    fn test_layout_invalidation() {
        let layout = RegisterLayout::resolve(8, 4);
        assert!(layout.matches(8, 4));
        assert!(!layout.matches(8, 5));
    }
}
