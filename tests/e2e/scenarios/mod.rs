mod document;
mod interaction;
mod literal;
mod tracks;
mod traffic;
mod updates;
