use serde::{Deserialize, Serialize};

pub type SessionId = u32;
pub type RoomId = uuid::Uuid;
pub type ObjectId = uuid::Uuid;
pub type UserId = uuid::Uuid;
pub type SequenceNumber = u64;
pub type ClientClock = u64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl std::default::Default for Color {
    fn default() -> Self {
        Self { r: 0, g: 0, b: 0 }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ObjectKind {
    Shape,
    Text,
    Sticker,
    Path,
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum AttrKind {
    Name,
    PosX,
    PosY,
    Width,
    Height,
    Rotation,
    FillColor,
    StrokeColor,
    ZIndex,
    Content,
    FontSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Float(f32),
    Reference(ObjectId),
    Color(Color),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&f32> {
        match self {
            Self::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ObjectId> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<&Color> {
        match self {
            Self::Color(c) => Some(c),
            _ => None,
        }
    }
}
