//! # Dimensionality Reduction
//!
//! Algorithms that map each row of a dense sample x feature matrix to a point in
//! the plane for scatter-plot views.
//!
//! ## Available
//! - **PCA** ([`pca`]): linear projection onto the directions of largest variance
//! - **t-SNE** ([`tsne`]): non-linear embedding that preserves local neighbourhoods
//! - **UMAP** ([`umap`]): simplified fuzzy-graph layout, seeded from PCA
//!
//! ## Algorithm Selection Guide
//! - Use **PCA** for linear relationships, feature analysis (loadings), and when
//!   interpretability is important
//! - Use **t-SNE** for non-linear visualization of clusters and local structure
//! - Use **UMAP** for a faster non-linear view that keeps more global structure
//!
//! PCA expects centered input; t-SNE and UMAP expect z-scored input (see
//! [`crate::dense::Preprocessing`]).

pub mod pca;
pub mod tsne;
pub mod umap;
