//! Message ids understood by the device manager
//!
//! Ids fall into three bands: requests `100..200`, responses `200..300` and
//! publications `300..400`. A request's reply uses the id `request + 100`, the
//! `RSP_ERR_*` ids may answer any request.

use super::ParamType::{self, *};

macro_rules! define_messages {
    ($($name:ident = $id:literal [$($param:ident),*],)+) => {
        $(
            pub const $name: u16 = $id;
        )+

        /// Parameter schema declared for `id`
        pub fn schema(id: u16) -> Option<&'static [ParamType]> {
            match id {
                $(
                    $id => Some(&[$($param),*]),
                )+
                _ => None,
            }
        }

        /// Symbolic name of `id`, used when logging
        pub fn name(id: u16) -> Option<&'static str> {
            match id {
                $(
                    $id => Some(stringify!($name)),
                )+
                _ => None,
            }
        }
    };
}

define_messages! {
    REQ_PING = 110 [],
    REQ_GET_DEVICE_ID = 111 [],
    REQ_GET_BRIGHTNESS = 112 [],
    REQ_SET_BRIGHTNESS = 113 [Int],
    REQ_INCREMENT_BRIGHTNESS = 114 [],
    REQ_DECREMENT_BRIGHTNESS = 115 [],
    REQ_BLANK_SCREEN = 116 [],
    REQ_UNBLANK_SCREEN = 117 [],
    REQ_GET_BATTERY_STATE = 118 [],
    REQ_GET_PERIPHERAL_ENABLED = 119 [Int],
    REQ_GET_SCREEN_BLANKING_TIMEOUT = 120 [],
    REQ_SET_SCREEN_BLANKING_TIMEOUT = 121 [Int],
    REQ_GET_LID_OPEN_STATE = 122 [],
    REQ_GET_SCREEN_BACKLIGHT_STATE = 123 [],
    REQ_SET_SCREEN_BACKLIGHT_STATE = 124 [Int],
    REQ_GET_OLED_CONTROL = 125 [],
    REQ_SET_OLED_CONTROL = 126 [Int],
    REQ_GET_OLED_SPI_BUS = 127 [],
    REQ_SET_OLED_SPI_BUS = 128 [Int],

    RSP_ERR_SERVER = 201 [],
    RSP_ERR_MALFORMED = 202 [],
    RSP_ERR_UNSUPPORTED = 203 [],

    RSP_PING = 210 [],
    RSP_GET_DEVICE_ID = 211 [Int],
    RSP_GET_BRIGHTNESS = 212 [Int],
    RSP_SET_BRIGHTNESS = 213 [],
    RSP_INCREMENT_BRIGHTNESS = 214 [],
    RSP_DECREMENT_BRIGHTNESS = 215 [],
    RSP_BLANK_SCREEN = 216 [],
    RSP_UNBLANK_SCREEN = 217 [],
    RSP_GET_BATTERY_STATE = 218 [Int, Int, Int, Int],
    RSP_GET_PERIPHERAL_ENABLED = 219 [Int],
    RSP_GET_SCREEN_BLANKING_TIMEOUT = 220 [Int],
    RSP_SET_SCREEN_BLANKING_TIMEOUT = 221 [],
    RSP_GET_LID_OPEN_STATE = 222 [Int],
    RSP_GET_SCREEN_BACKLIGHT_STATE = 223 [Int],
    RSP_SET_SCREEN_BACKLIGHT_STATE = 224 [],
    RSP_GET_OLED_CONTROL = 225 [Int],
    RSP_SET_OLED_CONTROL = 226 [],
    RSP_GET_OLED_SPI_BUS = 227 [Int],
    RSP_SET_OLED_SPI_BUS = 228 [],

    PUB_BRIGHTNESS_CHANGED = 300 [Int],
    PUB_PERIPHERAL_CONNECTED = 301 [Int],
    PUB_PERIPHERAL_DISCONNECTED = 302 [Int],
    PUB_SHUTDOWN_REQUESTED = 303 [],
    PUB_REBOOT_REQUIRED = 304 [],
    PUB_BATTERY_STATE_CHANGED = 305 [Int, Int, Int, Int],
    PUB_SCREEN_BLANKED = 306 [],
    PUB_SCREEN_UNBLANKED = 307 [],
    PUB_LOW_BATTERY_WARNING = 308 [],
    PUB_CRITICAL_BATTERY_WARNING = 309 [],
    PUB_LID_CLOSED = 310 [],
    PUB_LID_OPENED = 311 [],
    PUB_UNSUPPORTED_HARDWARE = 312 [],
    PUB_V3_BUTTON_UP_PRESSED = 313 [],
    PUB_V3_BUTTON_UP_RELEASED = 314 [],
    PUB_V3_BUTTON_DOWN_PRESSED = 315 [],
    PUB_V3_BUTTON_DOWN_RELEASED = 316 [],
    PUB_V3_BUTTON_SELECT_PRESSED = 317 [],
    PUB_V3_BUTTON_SELECT_RELEASED = 318 [],
    PUB_V3_BUTTON_CANCEL_PRESSED = 319 [],
    PUB_V3_BUTTON_CANCEL_RELEASED = 320 [],
    PUB_KEYBOARD_DOCKED = 321 [],
    PUB_KEYBOARD_UNDOCKED = 322 [],
    PUB_KEYBOARD_CONNECTED = 323 [],
    PUB_FAILED_KEYBOARD_CONNECT = 324 [],
    PUB_OLED_CONTROL_CHANGED = 325 [Int],
    PUB_OLED_SPI_BUS_CHANGED = 326 [Int],
}

const RESPONSE_OFFSET: u16 = 100;

pub fn is_request(id: u16) -> bool {
    (100..200).contains(&id)
}

pub fn is_response(id: u16) -> bool {
    (200..300).contains(&id)
}

pub fn is_publication(id: u16) -> bool {
    (300..400).contains(&id)
}

pub fn is_error_response(id: u16) -> bool {
    matches!(id, RSP_ERR_SERVER | RSP_ERR_MALFORMED | RSP_ERR_UNSUPPORTED)
}

/// The reply id paired with a known request
pub fn response_to(request: u16) -> Option<u16> {
    if !is_request(request) || schema(request).is_none() {
        return None;
    }

    let response = request + RESPONSE_OFFSET;
    schema(response).map(|_| response)
}
