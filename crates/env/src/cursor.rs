use common::{Address, DbId};

/// Opaque cursor handle returned by `Environment::cursor_create`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorId(pub usize);

/// Where a cursor stands.
///
/// Coupled cursors point at a concrete page and directory slot; when
/// their page is evicted they are uncoupled, capturing the key so the
/// next operation can re-seek.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorState {
    Nil,
    Coupled { address: Address, slot: usize },
    Uncoupled { key: Vec<u8> },
}

#[derive(Debug)]
pub struct Cursor {
    pub db: DbId,
    pub state: CursorState,
}

impl Cursor {
    pub fn new(db: DbId) -> Self {
        Self {
            db,
            state: CursorState::Nil,
        }
    }
}
