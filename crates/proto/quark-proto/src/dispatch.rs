//! Request-to-service dispatch.
//!
//! Keeps the operation set closed: every [`FileRequest`] variant maps
//! to exactly one [`FileService`] method, and every failure becomes the
//! matching wire code.

use crate::{FileRequest, FileResponse, FileService};

/// Runs one request against a service and produces its response.
pub fn dispatch(service: &impl FileService, request: &FileRequest) -> FileResponse {
    let result = match request {
        FileRequest::Open {
            path,
            options,
            access,
        } => service
            .open(path, *options, *access)
            .map(|handle| FileResponse::Opened { handle }),
        FileRequest::Close { handle } => service.close(*handle).map(|()| FileResponse::Done),
        FileRequest::Read {
            handle,
            buffer,
            buffer_offset,
            length,
        } => service
            .read(*handle, *buffer, *buffer_offset, *length)
            .map(|bytes| FileResponse::Transferred { bytes }),
        FileRequest::Write {
            handle,
            buffer,
            buffer_offset,
            length,
        } => service
            .write(*handle, *buffer, *buffer_offset, *length)
            .map(|bytes| FileResponse::Transferred { bytes }),
        FileRequest::Seek { handle, position } => {
            service.seek(*handle, *position).map(|()| FileResponse::Done)
        }
        FileRequest::Stat(target) => service.stat(target).map(FileResponse::Record),
        FileRequest::MakeDir { path } => service.make_dir(path).map(|()| FileResponse::Done),
        FileRequest::Unlink { path } => service.unlink(path).map(|()| FileResponse::Done),
        FileRequest::Move { from, to, copy } => {
            service.rename(from, to, *copy).map(|()| FileResponse::Done)
        }
        FileRequest::Link { from, to, symbolic } => {
            service.link(from, to, *symbolic).map(|()| FileResponse::Done)
        }
        FileRequest::ReadDir { handle } => service.read_dir(*handle).map(FileResponse::Entry),
        FileRequest::Flush { handle } => service.flush(*handle).map(|()| FileResponse::Done),
        FileRequest::Mount {
            path,
            at,
            fs_type,
            flags,
        } => service
            .mount(path, at, fs_type, *flags)
            .map(|()| FileResponse::Done),
        FileRequest::Unmount { path } => service.unmount(path).map(|()| FileResponse::Done),
    };
    FileResponse::from_result(result)
}
