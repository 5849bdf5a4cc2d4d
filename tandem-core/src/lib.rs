//! # tandem-core: Shared whiteboard document
//!
//! The document that two peers keep in sync. It is deliberately plain:
//! an ordered list of elements, mutated by user input and replaced
//! wholesale by snapshots received from the other peer.
//!
//! ```text
//!  user input ──► Board::add / translate / remove ──► ChangeNotice { User }
//!  remote     ──► Board::apply_snapshot           ──► ChangeNotice { Programmatic }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod document;

pub use document::{
    ChangeFeed, ChangeListener, ChangeNotice, ChangeOrigin, ListenerId, SharedDocument, Snapshot,
    SnapshotError,
};

/// Snapshot format written by [`Board::capture_snapshot`].
pub const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ShapeElement {
    pub id: Uuid,
    pub bounds: Rect,
}

impl ShapeElement {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            bounds: Rect::new(x, y, width, height),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TextElement {
    pub id: Uuid,
    pub content: String,
    pub bounds: Rect,
}

impl TextElement {
    pub fn new(content: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            bounds: Rect::new(x, y, 0.0, 0.0),
        }
    }
}

/// Freehand pen stroke.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StrokeElement {
    pub id: Uuid,
    pub points: Vec<Point>,
    pub width: f32,
}

impl StrokeElement {
    pub fn new(points: Vec<Point>, width: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            points,
            width,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    Rect(ShapeElement),
    Ellipse(ShapeElement),
    Text(TextElement),
    Stroke(StrokeElement),
}

impl Element {
    pub fn id(&self) -> Uuid {
        match self {
            Element::Rect(s) | Element::Ellipse(s) => s.id,
            Element::Text(t) => t.id,
            Element::Stroke(s) => s.id,
        }
    }

    /// JSON has no NaN or infinity, so only finite geometry survives a snapshot.
    pub fn is_finite(&self) -> bool {
        match self {
            Element::Rect(s) | Element::Ellipse(s) => s.bounds.is_finite(),
            Element::Text(t) => t.bounds.is_finite(),
            Element::Stroke(s) => s.width.is_finite() && s.points.iter().all(Point::is_finite),
        }
    }

    fn translate(&mut self, dx: f32, dy: f32) {
        match self {
            Element::Rect(s) | Element::Ellipse(s) => {
                s.bounds.x += dx;
                s.bounds.y += dy;
            }
            Element::Text(t) => {
                t.bounds.x += dx;
                t.bounds.y += dy;
            }
            Element::Stroke(s) => {
                for p in s.points.iter_mut() {
                    p.x += dx;
                    p.y += dy;
                }
            }
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum BoardError {
    #[error("Element not found: {0}")]
    ElementNotFound(Uuid),
    #[error("Element {0} is not a text element")]
    NotText(Uuid),
    #[error("Element {0} has non-finite geometry")]
    NonFinite(Uuid),
}

#[derive(Serialize)]
struct BoardStateRef<'a> {
    format: u32,
    elements: &'a [Element],
}

#[derive(Deserialize)]
struct BoardState {
    format: u32,
    elements: Vec<Element>,
}

/// The collaborative whiteboard.
///
/// Every mutation bumps the local version and notifies subscribers.
/// Direct mutators are tagged [`ChangeOrigin::User`]; snapshot application
/// is tagged [`ChangeOrigin::Programmatic`].
#[derive(Debug)]
pub struct Board {
    id: Uuid,
    version: u64,
    elements: Vec<Element>,
    feed: ChangeFeed,
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

impl Board {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 0,
            elements: Vec::new(),
            feed: ChangeFeed::new(),
        }
    }

    /// Local identity of this board instance (not part of snapshots).
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Element> {
        self.elements.iter().find(|e| e.id() == *id)
    }

    /// Append an element on top of the stack.
    pub fn add(&mut self, element: Element) -> Result<Uuid, BoardError> {
        let id = element.id();
        if !element.is_finite() {
            return Err(BoardError::NonFinite(id));
        }
        self.elements.push(element);
        self.commit(ChangeOrigin::User);
        Ok(id)
    }

    /// Move an element by (dx, dy). The board is left untouched if the
    /// result would not be finite.
    pub fn translate(&mut self, id: &Uuid, dx: f32, dy: f32) -> Result<(), BoardError> {
        let element = self.find_mut(id)?;
        let mut moved = element.clone();
        moved.translate(dx, dy);
        if !moved.is_finite() {
            return Err(BoardError::NonFinite(*id));
        }
        *element = moved;
        self.commit(ChangeOrigin::User);
        Ok(())
    }

    /// Replace the content of a text element.
    pub fn set_text(&mut self, id: &Uuid, content: impl Into<String>) -> Result<(), BoardError> {
        match self.find_mut(id)? {
            Element::Text(t) => t.content = content.into(),
            _ => return Err(BoardError::NotText(*id)),
        }
        self.commit(ChangeOrigin::User);
        Ok(())
    }

    pub fn remove(&mut self, id: &Uuid) -> Result<Element, BoardError> {
        let index = self
            .elements
            .iter()
            .position(|e| e.id() == *id)
            .ok_or(BoardError::ElementNotFound(*id))?;
        let removed = self.elements.remove(index);
        self.commit(ChangeOrigin::User);
        Ok(removed)
    }

    /// Remove every element.
    pub fn clear(&mut self) {
        self.elements.clear();
        self.commit(ChangeOrigin::User);
    }

    fn find_mut(&mut self, id: &Uuid) -> Result<&mut Element, BoardError> {
        self.elements
            .iter_mut()
            .find(|e| e.id() == *id)
            .ok_or(BoardError::ElementNotFound(*id))
    }

    fn commit(&mut self, origin: ChangeOrigin) {
        self.version += 1;
        self.feed.notify(ChangeNotice {
            origin,
            version: self.version,
        });
    }
}

impl SharedDocument for Board {
    fn capture_snapshot(&self) -> Snapshot {
        let state = BoardStateRef {
            format: SNAPSHOT_FORMAT,
            elements: &self.elements,
        };
        match serde_json::to_vec(&state) {
            Ok(bytes) => Snapshot::new(bytes),
            Err(e) => {
                log::error!("Board {} could not be serialized: {e}", self.id);
                Snapshot::new(Vec::new())
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let state: BoardState = serde_json::from_slice(snapshot.as_bytes())
            .map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        if state.format != SNAPSHOT_FORMAT {
            return Err(SnapshotError::Incompatible {
                found: state.format,
                expected: SNAPSHOT_FORMAT,
            });
        }

        log::debug!(
            "Board {} replaced: {} -> {} elements",
            self.id,
            self.elements.len(),
            state.elements.len()
        );
        self.elements = state.elements;
        self.commit(ChangeOrigin::Programmatic);
        Ok(())
    }

    fn subscribe(&mut self, listener: ChangeListener) -> ListenerId {
        self.feed.subscribe(listener)
    }

    fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.feed.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(board: &mut Board) -> Arc<Mutex<Vec<ChangeOrigin>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        board.subscribe(Box::new(move |n| sink.lock().unwrap().push(n.origin)));
        seen
    }

    #[test]
    fn test_board_creation() {
        let board = Board::new();
        assert!(board.is_empty());
        assert_eq!(board.version(), 0);
    }

    #[test]
    fn test_user_mutations_notify() {
        let mut board = Board::new();
        let seen = recorder(&mut board);

        let id = board.add(Element::Rect(ShapeElement::new(10.0, 20.0, 100.0, 50.0))).unwrap();
        board.translate(&id, 5.0, -5.0).unwrap();
        board.remove(&id).unwrap();

        assert_eq!(board.version(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![ChangeOrigin::User; 3]);
    }

    #[test]
    fn test_translate_moves_shape() {
        let mut board = Board::new();
        let id = board.add(Element::Ellipse(ShapeElement::new(0.0, 0.0, 10.0, 10.0))).unwrap();
        board.translate(&id, 3.0, 4.0).unwrap();

        match board.get(&id) {
            Some(Element::Ellipse(s)) => {
                assert_eq!(s.bounds.x, 3.0);
                assert_eq!(s.bounds.y, 4.0);
            }
            other => panic!("Wrong element: {other:?}"),
        }
    }

    #[test]
    fn test_missing_element_errors() {
        let mut board = Board::new();
        let ghost = Uuid::new_v4();
        assert_eq!(board.translate(&ghost, 1.0, 1.0), Err(BoardError::ElementNotFound(ghost)));
        assert!(board.remove(&ghost).is_err());
        assert_eq!(board.version(), 0);
    }

    #[test]
    fn test_set_text_requires_text_element() {
        let mut board = Board::new();
        let text = board.add(Element::Text(TextElement::new("two sum", 0.0, 0.0))).unwrap();
        let rect = board.add(Element::Rect(ShapeElement::new(0.0, 0.0, 1.0, 1.0))).unwrap();

        board.set_text(&text, "three sum").unwrap();
        assert_eq!(board.set_text(&rect, "nope"), Err(BoardError::NotText(rect)));

        match board.get(&text) {
            Some(Element::Text(t)) => assert_eq!(t.content, "three sum"),
            other => panic!("Wrong element: {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_replaces_state() {
        let mut source = Board::new();
        source.add(Element::Rect(ShapeElement::new(1.0, 2.0, 3.0, 4.0))).unwrap();
        source.add(Element::Stroke(StrokeElement::new(
            vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)],
            2.0,
        ))).unwrap();

        let mut target = Board::new();
        target.add(Element::Text(TextElement::new("stale", 0.0, 0.0))).unwrap();
        let seen = recorder(&mut target);

        target.apply_snapshot(&source.capture_snapshot()).unwrap();

        assert_eq!(target.elements(), source.elements());
        assert_eq!(target.capture_snapshot(), source.capture_snapshot());
        assert_eq!(*seen.lock().unwrap(), vec![ChangeOrigin::Programmatic]);
    }

    #[test]
    fn test_malformed_snapshot_keeps_state() {
        let mut board = Board::new();
        board.add(Element::Text(TextElement::new("keep me", 0.0, 0.0))).unwrap();
        let before = board.capture_snapshot();

        let err = board.apply_snapshot(&Snapshot::new(b"{not json".to_vec()));
        assert!(matches!(err, Err(SnapshotError::Malformed(_))));
        assert_eq!(board.capture_snapshot(), before);
    }

    #[test]
    fn test_incompatible_format_rejected() {
        let mut board = Board::new();
        let future = Snapshot::new(br#"{"format":99,"elements":[]}"#.to_vec());

        match board.apply_snapshot(&future) {
            Err(SnapshotError::Incompatible { found, expected }) => {
                assert_eq!(found, 99);
                assert_eq!(expected, SNAPSHOT_FORMAT);
            }
            other => panic!("Expected Incompatible, got {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_geometry_is_rejected() {
        let mut board = Board::new();
        let bad = ShapeElement::new(f32::NAN, 0.0, 1.0, 1.0);
        let bad_id = bad.id;
        assert_eq!(board.add(Element::Rect(bad)), Err(BoardError::NonFinite(bad_id)));
        assert!(board
            .add(Element::Stroke(StrokeElement::new(vec![Point::new(0.0, 0.0)], f32::INFINITY)))
            .is_err());
        assert!(board.is_empty());

        let id = board
            .add(Element::Rect(ShapeElement::new(f32::MAX, 0.0, 1.0, 1.0)))
            .unwrap();
        let before = board.capture_snapshot();
        assert_eq!(board.translate(&id, f32::NAN, 0.0), Err(BoardError::NonFinite(id)));
        assert_eq!(board.translate(&id, f32::MAX, 0.0), Err(BoardError::NonFinite(id)));
        assert_eq!(board.capture_snapshot(), before);
        assert_eq!(board.version(), 1);

        // Whatever the board accepted still round-trips to a peer.
        let mut peer = Board::new();
        peer.apply_snapshot(&board.capture_snapshot()).unwrap();
        assert_eq!(peer.elements(), board.elements());
    }

    #[test]
    fn test_snapshot_excludes_board_identity() {
        let a = Board::new();
        let b = Board::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.capture_snapshot(), b.capture_snapshot());
    }
}
