mod client;
mod oauth;

pub use client::{
    ApiErrorClass, DeletedFacet, DriveError, DriveItem, DriveItemPage, FileFacet, FileHashes,
    FolderFacet, GraphClient, ParentReference, RootFacet,
};
pub use oauth::{DEFAULT_SCOPES, OAuthClient, OAuthError, OAuthToken};
