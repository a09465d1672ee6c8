//! Wire protocol contract - opcodes, field layouts, flags.
//!
//! The server→client stream is a sequence of `{opcode: u8, payload}`
//! commands. Multi-byte integers are little-endian. Byte layouts below are
//! the interop contract with the browser interpreter and MUST NOT change.
//!
//! Command layouts:
//!
//! ```text
//! PING                    (0)  -
//! INSTALL_TEMPLATE        (1)  templateId:u16, tokenCount:u16,
//!                              tokenCount × tokenId:u16,
//!                              treeLen:u16 + tree bytes,
//!                              scriptLen:u16 + script bytes
//! INIT_WINDOW             (2)  windowId: 21 ASCII bytes
//! ATTACH_ANCHOR           (3)  blockId:u16, anchorIndex:u16, value:
//!                                textLen:u16 (top bit clear) + UTF-8, or
//!                                childBlockId:u16 with top bit set
//! ATTACH_EVENT_V2         (5)  blockId:u16, targetId:u8, eventType:u8,
//!                              flags:u8, clientFnId:u16, encoded args
//! ELEMENT_UPDATE          (7)  blockId:u16, targetId:u8, updateMode:u8,
//!                              mode-specific payload (token-or-string
//!                              name [+ value]; multi-style carries a u8
//!                              pair count)
//! INIT_BLOCK              (8)  blockId:u16, templateId:u16
//! REMOVE_BLOCKS           (9)  blockId:u16 list terminated by 0
//! INSTALL_CLIENT_FUNCTION (10) fnId:u16, encoded [argNames, bodySource]
//! RUN_CLIENT_FUNCTION     (11) fnId:u16, encoded args
//! MODIFY_TOKENMAP         (12) tokenLen:u8 + UTF-8, repeated,
//!                              terminated by a 0 length
//! INIT_SEQUENCE           (13) seqId:u16, initialLength:u16
//! MODIFY_SEQUENCE         (14) seqId:u16, opCode:u8, index:u16, count:u16
//! MODIFY_HEAD             (16) encoded head-mutation command object
//! ```
//!
//! Client→server messages: `portId:u16` (0 = pong, carrying the
//! acknowledged read offset as its first argument), then an encoded
//! argument list (see [`encode`]).
//!
//! Token-or-string fields: a `u16` with the top bit set is a token-table
//! id; with the top bit clear it is a string length followed by that many
//! UTF-8 bytes. New token ids are always streamed via `MODIFY_TOKENMAP`
//! before their first use.

pub mod decode;
pub mod encode;
pub mod tokens;
pub mod value;

pub use decode::{decode_message, Decoder, InputMessage};
pub use encode::encode_values;
pub use tokens::TokenTable;
pub use value::Value;

use bitflags::bitflags;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_PING: u8 = 0;
pub const OP_INSTALL_TEMPLATE: u8 = 1;
pub const OP_INIT_WINDOW: u8 = 2;
pub const OP_ATTACH_ANCHOR: u8 = 3;
pub const OP_ATTACH_EVENT_V2: u8 = 5;
pub const OP_ELEMENT_UPDATE: u8 = 7;
pub const OP_INIT_BLOCK: u8 = 8;
pub const OP_REMOVE_BLOCKS: u8 = 9;
pub const OP_INSTALL_CLIENT_FUNCTION: u8 = 10;
pub const OP_RUN_CLIENT_FUNCTION: u8 = 11;
pub const OP_MODIFY_TOKENMAP: u8 = 12;
pub const OP_INIT_SEQUENCE: u8 = 13;
pub const OP_MODIFY_SEQUENCE: u8 = 14;
pub const OP_MODIFY_HEAD: u8 = 16;

// =============================================================================
// Fixed protocol values
// =============================================================================

/// Length of a window id on the wire.
pub const WINDOW_ID_LEN: usize = 21;

/// Client→server port 0 is the pong/ack message.
pub const PORT_PONG: u16 = 0;

/// Reserved port: viewport size report `[width:int, height:int]`.
pub const PORT_VIEWPORT: u16 = 1;

/// Reserved port: client-side path change `[path:string]`.
pub const PORT_PATH: u16 = 2;

/// First port id available to application handlers.
pub const PORT_FIRST_USER: u16 = 3;

/// Top bit of a u16 marks a token id (vs. a raw string length) and a
/// child block id (vs. a text length) in `ATTACH_ANCHOR`.
pub const TOKEN_BIT: u16 = 0x8000;

/// WebSocket close code: unknown window id, client must hard-reload.
pub const CLOSE_UNKNOWN_WINDOW: u16 = 3001;

/// WebSocket close code: window-creation rate limit, client must not retry.
pub const CLOSE_RATE_LIMITED: u16 = 3010;

// =============================================================================
// ELEMENT_UPDATE modes
// =============================================================================

pub const UPDATE_MODE_SET_ATTRIBUTE: u8 = 0;
pub const UPDATE_MODE_SET_STYLE: u8 = 1;
pub const UPDATE_MODE_MULTI_STYLE: u8 = 2;
pub const UPDATE_MODE_REMOVE_ATTRIBUTE: u8 = 3;
pub const UPDATE_MODE_REMOVE_STYLE: u8 = 4;

// =============================================================================
// MODIFY_SEQUENCE ops
// =============================================================================

pub const SEQ_OP_INSERT: u8 = 1;
pub const SEQ_OP_REMOVE: u8 = 2;
pub const SEQ_OP_REPLACE: u8 = 3;
pub const SEQ_OP_SWAP: u8 = 4;

bitflags! {
    /// Listener options carried on `ATTACH_EVENT_V2`, applied by the
    /// client when it registers the DOM listener.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u8 {
        const PREVENT_DEFAULT  = 0b0000_0001;
        const STOP_PROPAGATION = 0b0000_0010;
        const ONCE             = 0b0000_0100;
    }
}

/// DOM event kinds the client can wire, by wire id.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Click = 0,
    Input = 1,
    Change = 2,
    Submit = 3,
    KeyDown = 4,
    KeyUp = 5,
    Focus = 6,
    Blur = 7,
    MouseEnter = 8,
    MouseLeave = 9,
    Scroll = 10,
}
