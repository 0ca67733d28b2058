//! GATT layout of BootBoots firmware

use uuid::Uuid;

/// Primary service of BootBoots cameras
pub const BOOTBOOTS_SERVICE_UUID: Uuid = Uuid::from_u128(0xbb00b007_5af3_41c3_9689_2fc7175c1ba8);

/// Primary service of the generic OTA firmware variant
pub const GENERIC_OTA_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);

/// Status characteristic (read + notify)
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0xbb00b007_e90f_49fa_89c5_31e705b74d85);

/// Logs characteristic. Resolved on connect; current firmware streams logs
/// as chunked responses on the command characteristic instead.
pub const LOGS_CHAR_UUID: Uuid = Uuid::from_u128(0xbb00b007_f1a2_49fa_89c5_31e705b74d86);

/// Command characteristic (write + notify)
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0xbb00b007_c0de_49fa_89c5_31e705b74d87);

/// Services accepted as primary, in preference order
pub const SERVICE_UUIDS: [Uuid; 2] = [BOOTBOOTS_SERVICE_UUID, GENERIC_OTA_SERVICE_UUID];

/// Advertised local name of the camera
pub const DEFAULT_DEVICE_NAME: &str = "BootBoots-CatCam";

/// Prefix shared by every BootBoots advertisement
pub const DEVICE_NAME_PREFIX: &str = "BootBoots";

/// Whether an advertised name belongs to a BootBoots device
pub fn is_bootboots_name(name: &str) -> bool {
    name.starts_with(DEVICE_NAME_PREFIX)
}
